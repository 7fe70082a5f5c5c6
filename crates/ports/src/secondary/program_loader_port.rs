use std::fmt;
use std::sync::Arc;

use domain::chain::entity::IpNetwork;
use domain::common::entity::{ChainName, Hook, RuleAction};
use domain::common::error::DomainError;
use domain::pipeline::entity::StageKind;
use ebpf_common::horus::{HorusKey, HorusValue};

/// Values indexed by `ChainName::index()`.
pub type PerChain<T> = [T; 3];

/// Closed set of programs the control plane places into slots, with
/// the parameters each one is generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Hook entry. Tail-calls the Horus slot first when one is active.
    Parser { horus_slot: Option<u16> },
    /// Picks the chain and applies per-chain defaults for empty chains.
    ChainSelector {
        defaults: PerChain<RuleAction>,
        rule_counts: PerChain<u32>,
        /// INPUT and FORWARD both accept by default and are empty.
        allow_all: bool,
    },
    /// Labels the connection state and runs the accept-established
    /// shortcut (`CONNTRACK_MODE_*` per chain).
    ConntrackLabel { modes: PerChain<u8> },
    /// Hands traffic to the first stage of each chain.
    ChainForwarder {
        entries: PerChain<Option<u16>>,
        defaults: PerChain<RuleAction>,
    },
    ConntrackTableUpdate,
    /// INPUT fast path over the pinned-field signature.
    Horus { signature: u8 },
    /// One pipeline stage of a chain.
    Stage {
        chain: ChainName,
        kind: StageKind,
        next: Option<u16>,
        default_action: RuleAction,
        rule_count: u32,
    },
}

impl Program {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parser { .. } => "parser",
            Self::ChainSelector { .. } => "chain_selector",
            Self::ConntrackLabel { .. } => "conntrack_label",
            Self::ChainForwarder { .. } => "chain_forwarder",
            Self::ConntrackTableUpdate => "conntrack_table_update",
            Self::Horus { .. } => "horus",
            Self::Stage { .. } => "stage",
        }
    }
}

/// A program together with the slot it is placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub index: u16,
    pub hook: Hook,
    pub program: Program,
}

impl fmt::Display for ProgramSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.program {
            Program::Stage { chain, kind, .. } => {
                write!(f, "{chain}/{kind}@{}:{}", self.hook, self.index)
            }
            other => write!(f, "{}@{}:{}", other.name(), self.hook, self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    ExactMatch,
    LongestPrefixMatch,
    Array,
    PerCpuArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKey {
    /// Array position: rule id, chain index, conntrack state or TCP
    /// flag combination.
    Index(u32),
    Proto(u8),
    Port(u16),
    Ifindex(u32),
    Prefix(IpNetwork),
    Horus(HorusKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableValue {
    Bitvector(Vec<u64>),
    Action(u8),
    /// Per-cpu arrays report the sum over all CPUs.
    Counter(u64),
    Horus(HorusValue),
}

impl TableValue {
    pub fn as_counter(&self) -> u64 {
        match self {
            Self::Counter(n) => *n,
            _ => 0,
        }
    }
}

/// Typed access to one table of a loaded program.
pub trait TableHandle: Send + Sync {
    fn kind(&self) -> TableKind;

    fn get(&self, key: &TableKey) -> Result<Option<TableValue>, DomainError>;

    /// Writing a per-cpu array sets the value on every CPU.
    fn set(&self, key: TableKey, value: TableValue) -> Result<(), DomainError>;

    fn get_all(&self) -> Result<Vec<(TableKey, TableValue)>, DomainError>;
}

/// A program placed into a slot.
pub trait ProgramHandle: Send + Sync {
    fn index(&self) -> u16;

    fn hook(&self) -> Hook;

    fn table(&self, name: &str) -> Result<Arc<dyn TableHandle>, DomainError>;
}

/// The substrate that compiles programs into slots.
///
/// Implementations serialize their own state; the control plane calls
/// them while holding the instance lock.
pub trait ProgramLoaderPort: Send + Sync {
    /// Place a program into a slot, replacing any previous occupant.
    /// Its tables start empty.
    fn load(&self, spec: &ProgramSpec) -> Result<Arc<dyn ProgramHandle>, DomainError>;

    /// Regenerate the program in an occupied slot, keeping its tables.
    fn reload(&self, spec: &ProgramSpec) -> Result<(), DomainError>;

    /// Empty a slot. Unloading an empty slot is not an error.
    fn unload(&self, index: u16, hook: Hook) -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::compiler::field::MatchField;

    #[test]
    fn program_loader_port_is_object_safe() {
        fn _check(port: &dyn ProgramLoaderPort, handle: &dyn ProgramHandle) {
            let _ = port.unload(7, Hook::Ingress);
            let _ = handle.table("actions");
        }
    }

    #[test]
    fn spec_display_names_slot() {
        let spec = ProgramSpec {
            index: 12,
            hook: Hook::Ingress,
            program: Program::Stage {
                chain: ChainName::Input,
                kind: StageKind::Field(MatchField::DstPort),
                next: Some(15),
                default_action: RuleAction::Drop,
                rule_count: 2,
            },
        };
        assert_eq!(spec.to_string(), "INPUT/portdst@ingress:12");
        let parser = ProgramSpec {
            index: 0,
            hook: Hook::Egress,
            program: Program::Parser { horus_slot: None },
        };
        assert_eq!(parser.to_string(), "parser@egress:0");
    }

    #[test]
    fn counter_values() {
        assert_eq!(TableValue::Counter(7).as_counter(), 7);
        assert_eq!(TableValue::Action(1).as_counter(), 0);
    }
}
