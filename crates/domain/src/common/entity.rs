use std::fmt;
use std::str::FromStr;

use ebpf_common::pipeline::{
    ACTION_ACCEPT, ACTION_DROP, CHAIN_INDEX_FORWARD, CHAIN_INDEX_INPUT, CHAIN_INDEX_OUTPUT,
    CT_ESTABLISHED, CT_INVALID, CT_NEW, CT_RELATED, IPPROTO_GRE, IPPROTO_ICMP, IPPROTO_TCP,
    IPPROTO_UDP,
};
use serde::{Deserialize, Serialize};

/// One of the three fixed traffic directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainName {
    Input,
    Forward,
    Output,
}

impl ChainName {
    pub const ALL: [ChainName; 3] = [Self::Input, Self::Forward, Self::Output];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Forward => "FORWARD",
            Self::Output => "OUTPUT",
        }
    }

    /// Hook whose program array carries this chain's stages.
    pub fn hook(self) -> Hook {
        match self {
            Self::Input | Self::Forward => Hook::Ingress,
            Self::Output => Hook::Egress,
        }
    }

    /// Position in per-chain arrays of the entry programs.
    pub fn index(self) -> u32 {
        match self {
            Self::Input => CHAIN_INDEX_INPUT,
            Self::Forward => CHAIN_INDEX_FORWARD,
            Self::Output => CHAIN_INDEX_OUTPUT,
        }
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INPUT" => Ok(Self::Input),
            "FORWARD" => Ok(Self::Forward),
            "OUTPUT" => Ok(Self::Output),
            other => Err(format!("unknown chain '{other}'")),
        }
    }
}

/// Attachment point of a program array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    Ingress,
    Egress,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of a rule or of a chain's default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Drop,
    Accept,
}

impl RuleAction {
    /// Convert to the u8 value used in action tables.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Drop => ACTION_DROP,
            Self::Accept => ACTION_ACCEPT,
        }
    }

    /// Create from a table value. Unknown values map to `Drop`.
    pub fn from_u8(n: u8) -> Self {
        if n == ACTION_ACCEPT {
            Self::Accept
        } else {
            Self::Drop
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("DROP"),
            Self::Accept => f.write_str("ACCEPT"),
        }
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DROP" => Ok(Self::Drop),
            "ACCEPT" => Ok(Self::Accept),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Connection state assigned by the conntrack label program.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConntrackStatus {
    #[default]
    New,
    Established,
    Related,
    Invalid,
}

impl ConntrackStatus {
    pub const ALL: [ConntrackStatus; 4] =
        [Self::New, Self::Established, Self::Related, Self::Invalid];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Established => "established",
            Self::Related => "related",
            Self::Invalid => "invalid",
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::New => CT_NEW,
            Self::Established => CT_ESTABLISHED,
            Self::Related => CT_RELATED,
            Self::Invalid => CT_INVALID,
        }
    }
}

impl FromStr for ConntrackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "ESTABLISHED" => Ok(Self::Established),
            "RELATED" => Ok(Self::Related),
            "INVALID" => Ok(Self::Invalid),
            other => Err(format!("unknown connection state '{other}'")),
        }
    }
}

/// L4 protocols accepted in rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
    Gre,
}

impl L4Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Gre => "gre",
        }
    }

    /// IP protocol number.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Tcp => IPPROTO_TCP,
            Self::Udp => IPPROTO_UDP,
            Self::Icmp => IPPROTO_ICMP,
            Self::Gre => IPPROTO_GRE,
        }
    }
}

impl FromStr for L4Proto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "ICMP" => Ok(Self::Icmp),
            "GRE" => Ok(Self::Gre),
            other => Err(format!("unsupported protocol '{other}'")),
        }
    }
}
