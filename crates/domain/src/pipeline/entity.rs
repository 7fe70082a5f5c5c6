use std::fmt;

use ebpf_common::pipeline::{STAGE_ACTION, STAGE_BITSCAN, stage_bank_base};

use crate::chain::entity::PacketInfo;
use crate::compiler::bitvector::BitVector;
use crate::compiler::field::{CompiledField, MatchField};
use crate::common::entity::{ChainName, RuleAction};

/// Which of the two alternating stage banks a generation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Bank(u8);

impl Bank {
    pub fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn flip(self) -> Self {
        Self(self.0 ^ 1)
    }

    /// First slot of this bank for `chain`.
    pub fn base(self, chain: ChainName) -> u16 {
        stage_bank_base(chain == ChainName::Forward, self.0)
    }
}

/// Closed set of stage programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Field(MatchField),
    BitScan,
    Action,
}

impl StageKind {
    pub fn offset(self) -> u16 {
        match self {
            Self::Field(f) => f.stage_offset(),
            Self::BitScan => STAGE_BITSCAN,
            Self::Action => STAGE_ACTION,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => write!(f, "{field}"),
            Self::BitScan => f.write_str("bitscan"),
            Self::Action => f.write_str("action"),
        }
    }
}

/// Table content a stage is programmed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageTable {
    Field(CompiledField),
    BitScan,
    /// Action per rule id.
    Action(Vec<RuleAction>),
}

impl StageTable {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Field(c) => StageKind::Field(c.field),
            Self::BitScan => StageKind::BitScan,
            Self::Action(_) => StageKind::Action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub index: u16,
    pub table: StageTable,
    /// Slot the stage hands off to; `None` for the action stage.
    pub next: Option<u16>,
}

impl PlannedStage {
    pub fn kind(&self) -> StageKind {
        self.table.kind()
    }
}

/// Outcome of classifying one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: RuleAction,
    /// Matching rule, `None` when the chain default applied.
    pub rule: Option<usize>,
}

impl Verdict {
    pub fn default_action(action: RuleAction) -> Self {
        Self { action, rule: None }
    }
}

/// Packet and byte totals of a rule or default action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketCounters {
    pub packets: u64,
    pub bytes: u64,
}

impl PacketCounters {
    pub fn add(&mut self, other: PacketCounters) {
        self.packets = self.packets.saturating_add(other.packets);
        self.bytes = self.bytes.saturating_add(other.bytes);
    }
}

/// A chain's full stage set for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    pub chain: ChainName,
    pub bank: Bank,
    pub default_action: RuleAction,
    pub rule_count: usize,
    pub max_rules: u32,
    /// Stages in traversal order.
    pub stages: Vec<PlannedStage>,
}

impl PipelinePlan {
    /// Slot the forwarder hands this chain's traffic to. `None` when the
    /// chain has no rules and its default action applies directly.
    pub fn entry(&self) -> Option<u16> {
        self.stages.first().map(|s| s.index)
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(PlannedStage::kind).collect()
    }

    pub fn stage(&self, index: u16) -> Option<&PlannedStage> {
        self.stages.iter().find(|s| s.index == index)
    }

    /// Walk the stages the way the datapath does.
    pub fn classify(&self, packet: &PacketInfo) -> Verdict {
        let mut candidates = BitVector::with_first(self.rule_count, self.max_rules);
        let mut matched = None;
        let mut hop = self.entry();
        while let Some(index) = hop {
            let Some(stage) = self.stage(index) else {
                break;
            };
            match &stage.table {
                StageTable::Field(field) => match field.lookup(self.chain, packet) {
                    Some(bv) => {
                        candidates.and_assign(bv);
                        if candidates.is_empty() {
                            break;
                        }
                    }
                    None => break,
                },
                StageTable::BitScan => {
                    matched = candidates.first_set();
                    if matched.is_none() {
                        break;
                    }
                }
                StageTable::Action(actions) => {
                    if let Some(rule) = matched
                        && let Some(action) = actions.get(rule)
                    {
                        return Verdict {
                            action: *action,
                            rule: Some(rule),
                        };
                    }
                    break;
                }
            }
            hop = stage.next;
        }
        Verdict::default_action(self.default_action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_flips_and_bases() {
        let bank = Bank::default();
        assert_eq!(bank.value(), 0);
        assert_eq!(bank.flip().value(), 1);
        assert_eq!(bank.flip().flip(), bank);
        assert_eq!(bank.base(ChainName::Input), 7);
        assert_eq!(bank.flip().base(ChainName::Output), 17);
        assert_eq!(bank.base(ChainName::Forward), 27);
    }

    #[test]
    fn empty_plan_uses_default() {
        let plan = PipelinePlan {
            chain: ChainName::Input,
            bank: Bank::default(),
            default_action: RuleAction::Accept,
            rule_count: 0,
            max_rules: 64,
            stages: Vec::new(),
        };
        assert_eq!(plan.entry(), None);
        assert_eq!(
            plan.classify(&PacketInfo::default()),
            Verdict::default_action(RuleAction::Accept)
        );
    }
}
