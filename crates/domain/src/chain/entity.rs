use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ebpf_common::pipeline::{
    TCP_FLAG_ACK, TCP_FLAG_CWR, TCP_FLAG_ECE, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST,
    TCP_FLAG_SYN, TCP_FLAG_URG,
};
use serde::{Deserialize, Serialize};

use crate::common::entity::{ChainName, ConntrackStatus, L4Proto, RuleAction};

use super::error::ChainError;

// ── IPv4 network ────────────────────────────────────────────────────

/// IPv4 network in host byte order. The address is stored masked to
/// its prefix, so `10.0.0.1/8` and `10.0.0.0/8` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpNetwork {
    pub addr: u32,
    pub prefix_len: u8,
}

impl IpNetwork {
    /// Catch-all network used as the synthesized wildcard entry.
    pub const ANY: IpNetwork = IpNetwork {
        addr: 0,
        prefix_len: 0,
    };

    pub fn new(addr: u32, prefix_len: u8) -> Result<Self, ChainError> {
        if prefix_len > 32 {
            return Err(ChainError::InvalidCidr {
                value: format!("{}/{prefix_len}", Ipv4Addr::from(addr)),
                reason: "prefix length must be 0-32".to_string(),
            });
        }
        Ok(Self {
            addr: addr & prefix_mask(prefix_len),
            prefix_len,
        })
    }

    pub fn mask(&self) -> u32 {
        prefix_mask(self.prefix_len)
    }

    pub fn contains(&self, ip: u32) -> bool {
        ip & self.mask() == self.addr
    }

    /// `true` if every address of `other` is inside `self`.
    pub fn covers(&self, other: &IpNetwork) -> bool {
        self.prefix_len <= other.prefix_len && other.addr & self.mask() == self.addr
    }

    pub fn is_host(&self) -> bool {
        self.prefix_len == 32
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix_len.min(32)))
    }
}

impl FromStr for IpNetwork {
    type Err = ChainError;

    /// Parses `a.b.c.d/len`, or a bare address as a /32.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ChainError::InvalidCidr {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid("bad address"))?;
        let prefix_len = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid("bad prefix"))?,
            None => 32,
        };
        if prefix_len > 32 {
            return Err(invalid("prefix length must be 0-32"));
        }
        Self::new(u32::from(addr), prefix_len)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.prefix_len)
    }
}

// ── TCP flags ───────────────────────────────────────────────────────

const TCP_FLAG_NAMES: [(&str, u8); 8] = [
    ("FIN", TCP_FLAG_FIN),
    ("SYN", TCP_FLAG_SYN),
    ("RST", TCP_FLAG_RST),
    ("PSH", TCP_FLAG_PSH),
    ("ACK", TCP_FLAG_ACK),
    ("URG", TCP_FLAG_URG),
    ("ECE", TCP_FLAG_ECE),
    ("CWR", TCP_FLAG_CWR),
];

/// Flags that must be set and flags that must be clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpFlags {
    pub set: u8,
    pub clear: u8,
}

impl TcpFlags {
    /// `true` if the 8-bit flag combination satisfies both masks.
    pub fn matches(&self, combination: u8) -> bool {
        combination & self.set == self.set && combination & self.clear == 0
    }
}

impl FromStr for TcpFlags {
    type Err = ChainError;

    /// Parses tokens such as `SYN !ACK`, separated by spaces or commas.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ChainError::InvalidTcpFlags {
            value: s.to_string(),
            reason,
        };
        let mut flags = TcpFlags { set: 0, clear: 0 };
        let mut seen = false;
        for token in s.split([' ', ',']).filter(|t| !t.is_empty()) {
            seen = true;
            let (negated, name) = match token.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let bit = TCP_FLAG_NAMES
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, b)| *b)
                .ok_or_else(|| invalid(format!("unknown flag '{name}'")))?;
            if negated {
                flags.clear |= bit;
            } else {
                flags.set |= bit;
            }
        }
        if !seen {
            return Err(invalid("no flags given".to_string()));
        }
        if flags.set & flags.clear != 0 {
            return Err(invalid("flag both set and cleared".to_string()));
        }
        Ok(flags)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, bit) in TCP_FLAG_NAMES {
            let prefix = if self.set & bit != 0 {
                ""
            } else if self.clear & bit != 0 {
                "!"
            } else {
                continue;
            };
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{prefix}{name}")?;
            first = false;
        }
        Ok(())
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// Textual rule as received from configuration. Every field except
/// `action` is optional; absent means wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(default)]
    pub conntrack: Option<String>,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub sport: Option<u16>,
    #[serde(default)]
    pub dport: Option<u16>,
    #[serde(default)]
    pub in_iface: Option<String>,
    #[serde(default)]
    pub out_iface: Option<String>,
    #[serde(default)]
    pub tcpflags: Option<String>,
    #[serde(default)]
    pub l4proto: Option<String>,
    #[serde(default)]
    pub action: RuleAction,
}

impl RuleSpec {
    /// Parse every field into a typed rule. Interface names are kept as
    /// names; they are resolved when the chain is compiled.
    pub fn to_rule(&self) -> Result<ChainRule, ChainError> {
        Ok(ChainRule {
            conntrack: self
                .conntrack
                .as_deref()
                .map(|s| s.parse::<ConntrackStatus>().map_err(ChainError::InvalidValue))
                .transpose()?,
            src: self.src.as_deref().map(str::parse).transpose()?,
            dst: self.dst.as_deref().map(str::parse).transpose()?,
            sport: self.sport.map(validate_port).transpose()?,
            dport: self.dport.map(validate_port).transpose()?,
            in_iface: non_empty(self.in_iface.as_deref()),
            out_iface: non_empty(self.out_iface.as_deref()),
            tcp_flags: self.tcpflags.as_deref().map(str::parse).transpose()?,
            l4proto: self
                .l4proto
                .as_deref()
                .map(|s| s.parse::<L4Proto>().map_err(ChainError::InvalidValue))
                .transpose()?,
            action: self.action,
        })
    }
}

impl From<&ChainRule> for RuleSpec {
    /// Textual form of a stored rule, as written back to configuration.
    fn from(rule: &ChainRule) -> Self {
        Self {
            conntrack: rule.conntrack.map(|c| c.as_str().to_string()),
            src: rule.src.map(|n| n.to_string()),
            dst: rule.dst.map(|n| n.to_string()),
            sport: rule.sport,
            dport: rule.dport,
            in_iface: rule.in_iface.clone(),
            out_iface: rule.out_iface.clone(),
            tcpflags: rule.tcp_flags.map(|f| f.to_string()),
            l4proto: rule.l4proto.map(|p| p.as_str().to_string()),
            action: rule.action,
        }
    }
}

fn validate_port(port: u16) -> Result<u16, ChainError> {
    if port == 0 {
        return Err(ChainError::InvalidPort { port });
    }
    Ok(port)
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// A parsed rule. Equality covers every field and drives
/// delete-by-match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChainRule {
    pub conntrack: Option<ConntrackStatus>,
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub tcp_flags: Option<TcpFlags>,
    pub l4proto: Option<L4Proto>,
    pub action: RuleAction,
}

impl ChainRule {
    /// `{conntrack = ESTABLISHED, action = ACCEPT}` and nothing else.
    pub fn accept_established() -> Self {
        Self {
            conntrack: Some(ConntrackStatus::Established),
            action: RuleAction::Accept,
            ..Self::default()
        }
    }

    /// Interface name this rule matches on in `chain`: the input
    /// interface for INPUT/FORWARD, the output interface for OUTPUT.
    pub fn interface_for(&self, chain: ChainName) -> Option<&str> {
        match chain {
            ChainName::Input | ChainName::Forward => self.in_iface.as_deref(),
            ChainName::Output => self.out_iface.as_deref(),
        }
    }

    /// Reject interface fields the chain's interface stage does not
    /// match on. INPUT and FORWARD only see the input interface.
    pub fn validate_for(&self, chain: ChainName) -> Result<(), ChainError> {
        match chain {
            ChainName::Input | ChainName::Forward if self.out_iface.is_some() => {
                Err(ChainError::InterfaceDirection {
                    chain,
                    field: "out_iface",
                })
            }
            ChainName::Output if self.in_iface.is_some() => Err(ChainError::InterfaceDirection {
                chain,
                field: "in_iface",
            }),
            _ => Ok(()),
        }
    }

    /// Linear first-match semantics of a single rule. `resolve` maps an
    /// interface name to its index.
    pub fn matches<F>(&self, chain: ChainName, packet: &PacketInfo, resolve: F) -> bool
    where
        F: Fn(&str) -> Option<u32>,
    {
        if let Some(state) = self.conntrack
            && state != packet.conntrack
        {
            return false;
        }
        if let Some(ref net) = self.src
            && !net.contains(packet.src_ip)
        {
            return false;
        }
        if let Some(ref net) = self.dst
            && !net.contains(packet.dst_ip)
        {
            return false;
        }
        if let Some(proto) = self.l4proto
            && proto.to_u8() != packet.l4proto
        {
            return false;
        }
        if self.sport.is_some_and(|p| p != packet.src_port)
            || self.dport.is_some_and(|p| p != packet.dst_port)
        {
            return false;
        }
        if let Some(name) = self.interface_for(chain)
            && resolve(name) != Some(packet.interface_for(chain))
        {
            return false;
        }
        if let Some(flags) = self.tcp_flags
            && !flags.matches(packet.tcp_flags)
        {
            return false;
        }
        true
    }
}

impl fmt::Display for ChainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(state) = self.conntrack {
            write!(f, "ct={state:?} ")?;
        }
        if let Some(net) = self.src {
            write!(f, "src={net} ")?;
        }
        if let Some(net) = self.dst {
            write!(f, "dst={net} ")?;
        }
        if let Some(proto) = self.l4proto {
            write!(f, "proto={proto:?} ")?;
        }
        if let Some(port) = self.sport {
            write!(f, "sport={port} ")?;
        }
        if let Some(port) = self.dport {
            write!(f, "dport={port} ")?;
        }
        if let Some(ref iface) = self.in_iface {
            write!(f, "in={iface} ")?;
        }
        if let Some(ref iface) = self.out_iface {
            write!(f, "out={iface} ")?;
        }
        if let Some(flags) = self.tcp_flags {
            write!(f, "flags=[{flags}] ")?;
        }
        write!(f, "-> {}", self.action)
    }
}

// ── Packets ─────────────────────────────────────────────────────────

/// Header fields the pipeline matches on. Addresses in host byte
/// order; ports and flags are zero when the protocol has none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub conntrack: ConntrackStatus,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub l4proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub in_ifindex: u32,
    pub out_ifindex: u32,
    pub tcp_flags: u8,
    /// Frame length, for byte counters.
    pub len: u32,
}

impl PacketInfo {
    pub fn interface_for(&self, chain: ChainName) -> u32 {
        match chain {
            ChainName::Input | ChainName::Forward => self.in_ifindex,
            ChainName::Output => self.out_ifindex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_ifaces(_: &str) -> Option<u32> {
        None
    }

    #[test]
    fn parse_cidr_masks_host_bits() {
        let net: IpNetwork = "10.1.2.3/8".parse().unwrap();
        assert_eq!(net.addr, 0x0A00_0000);
        assert_eq!(net.prefix_len, 8);
        assert_eq!(net, "10.0.0.0/8".parse().unwrap());
        assert_eq!(net.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn parse_bare_address_is_host() {
        let net: IpNetwork = "192.168.1.1".parse().unwrap();
        assert!(net.is_host());
        assert!(net.contains(0xC0A8_0101));
        assert!(!net.contains(0xC0A8_0102));
    }

    #[test]
    fn parse_cidr_rejects_garbage() {
        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("10.0.0/8".parse::<IpNetwork>().is_err());
        assert!("any".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn zero_prefix_contains_everything() {
        assert!(IpNetwork::ANY.contains(0xFFFF_FFFF));
        assert!(IpNetwork::ANY.covers(&"1.2.3.4/32".parse().unwrap()));
    }

    #[test]
    fn covers_requires_shorter_prefix() {
        let wide: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let narrow: IpNetwork = "10.1.0.0/16".parse().unwrap();
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(!wide.covers(&"11.0.0.0/16".parse().unwrap()));
    }

    #[test]
    fn tcp_flags_parse_and_match() {
        let flags: TcpFlags = "SYN !ACK".parse().unwrap();
        assert_eq!(flags.set, TCP_FLAG_SYN);
        assert_eq!(flags.clear, TCP_FLAG_ACK);
        assert!(flags.matches(TCP_FLAG_SYN));
        assert!(flags.matches(TCP_FLAG_SYN | TCP_FLAG_PSH));
        assert!(!flags.matches(TCP_FLAG_SYN | TCP_FLAG_ACK));
        assert!(!flags.matches(0));
        assert_eq!(flags.to_string(), "SYN !ACK");
    }

    #[test]
    fn tcp_flags_negative_only() {
        let flags: TcpFlags = "!RST".parse().unwrap();
        assert!(flags.matches(0));
        assert!(flags.matches(TCP_FLAG_ACK));
        assert!(!flags.matches(TCP_FLAG_RST));
    }

    #[test]
    fn tcp_flags_reject_conflicts_and_unknown() {
        assert!("SYN,!SYN".parse::<TcpFlags>().is_err());
        assert!("SYN BOGUS".parse::<TcpFlags>().is_err());
        assert!("".parse::<TcpFlags>().is_err());
    }

    #[test]
    fn spec_to_rule_parses_all_fields() {
        let spec = RuleSpec {
            conntrack: Some("new".to_string()),
            src: Some("10.0.0.0/8".to_string()),
            dst: Some("192.168.0.1".to_string()),
            sport: Some(1024),
            dport: Some(22),
            in_iface: Some("eth0".to_string()),
            out_iface: None,
            tcpflags: Some("SYN".to_string()),
            l4proto: Some("tcp".to_string()),
            action: RuleAction::Accept,
        };
        let rule = spec.to_rule().unwrap();
        assert_eq!(rule.conntrack, Some(ConntrackStatus::New));
        assert_eq!(rule.dst.unwrap().prefix_len, 32);
        assert_eq!(rule.l4proto, Some(L4Proto::Tcp));
        assert_eq!(rule.in_iface.as_deref(), Some("eth0"));
        assert_eq!(rule.action, RuleAction::Accept);
    }

    #[test]
    fn spec_to_rule_rejects_port_zero() {
        let spec = RuleSpec {
            dport: Some(0),
            ..RuleSpec::default()
        };
        assert!(matches!(
            spec.to_rule(),
            Err(ChainError::InvalidPort { port: 0 })
        ));
    }

    #[test]
    fn spec_default_action_is_drop() {
        let spec: RuleSpec = serde_yaml_ng::from_str("dport: 80").unwrap();
        assert_eq!(spec.to_rule().unwrap().action, RuleAction::Drop);
    }

    #[test]
    fn stored_rule_converts_back_to_spec() {
        let spec: RuleSpec = serde_yaml_ng::from_str(
            "{conntrack: NEW, src: 10.1.2.3/16, dport: 443, l4proto: TCP, \
             tcpflags: 'SYN,!ACK', in_iface: eth0, action: accept}",
        )
        .unwrap();
        let rule = spec.to_rule().unwrap();
        let written = RuleSpec::from(&rule);
        assert_eq!(written.src.as_deref(), Some("10.1.0.0/16"));
        assert_eq!(written.l4proto.as_deref(), Some("tcp"));
        assert_eq!(written.to_rule().unwrap(), rule);
    }

    #[test]
    fn interface_direction_validation() {
        let rule = ChainRule {
            out_iface: Some("eth1".to_string()),
            ..ChainRule::default()
        };
        assert!(rule.validate_for(ChainName::Input).is_err());
        assert!(matches!(
            rule.validate_for(ChainName::Forward),
            Err(ChainError::InterfaceDirection { field: "out_iface", .. })
        ));
        assert!(rule.validate_for(ChainName::Output).is_ok());

        let ingress = ChainRule {
            in_iface: Some("eth0".to_string()),
            ..ChainRule::default()
        };
        assert!(ingress.validate_for(ChainName::Forward).is_ok());
        assert!(ingress.validate_for(ChainName::Output).is_err());
    }

    #[test]
    fn linear_match_checks_every_set_field() {
        let rule = ChainRule {
            dst: Some("10.0.0.0/24".parse().unwrap()),
            dport: Some(443),
            l4proto: Some(L4Proto::Tcp),
            action: RuleAction::Accept,
            ..ChainRule::default()
        };
        let mut packet = PacketInfo {
            dst_ip: 0x0A00_0005,
            dst_port: 443,
            l4proto: 6,
            ..PacketInfo::default()
        };
        assert!(rule.matches(ChainName::Input, &packet, no_ifaces));
        packet.l4proto = 17;
        assert!(!rule.matches(ChainName::Input, &packet, no_ifaces));
    }

    #[test]
    fn accept_established_shape() {
        let rule = ChainRule::accept_established();
        assert_eq!(rule.conntrack, Some(ConntrackStatus::Established));
        assert_eq!(rule.action, RuleAction::Accept);
        assert!(rule.src.is_none() && rule.dport.is_none());
    }
}
