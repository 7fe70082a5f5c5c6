use std::collections::BTreeMap;

use ebpf_common::horus::{HorusValue, MAX_RULES_FOR_HORUS, MIN_RULES_FOR_HORUS};

use crate::chain::entity::ChainRule;

use super::entity::{HorusSignature, HorusTable};

/// Decides whether the INPUT fast path applies and builds its table.
#[derive(Debug, Clone, Copy)]
pub struct HorusCompiler {
    min_rules: usize,
    max_rules: usize,
}

impl HorusCompiler {
    pub fn new() -> Self {
        Self {
            min_rules: MIN_RULES_FOR_HORUS,
            max_rules: MAX_RULES_FOR_HORUS,
        }
    }

    pub fn with_limits(min_rules: usize, max_rules: usize) -> Self {
        Self {
            min_rules: min_rules.max(1),
            max_rules,
        }
    }

    /// Build the table for the homogeneous prefix of `input`, or `None`
    /// when FORWARD has rules, rule 0 pins nothing, or the prefix is
    /// shorter than the threshold.
    pub fn compile(&self, input: &[ChainRule], forward_rules: usize) -> Option<HorusTable> {
        if forward_rules > 0 || input.len() < self.min_rules {
            return None;
        }
        let signature = HorusSignature::of(input.first()?)?;
        if signature.is_empty() {
            return None;
        }

        let mut entries = BTreeMap::new();
        let mut covered_rules = 0;
        for (id, rule) in input.iter().enumerate().take(self.max_rules) {
            if HorusSignature::of(rule) != Some(signature) {
                break;
            }
            let value = HorusValue {
                action: rule.action.to_u8(),
                _pad: [0; 3],
                rule_id: u32::try_from(id).ok()?,
            };
            entries.entry(signature.rule_key(rule)).or_insert(value);
            covered_rules = id + 1;
        }

        if covered_rules < self.min_rules {
            return None;
        }
        Some(HorusTable {
            signature,
            covered_rules,
            entries,
        })
    }
}

impl Default for HorusCompiler {
    fn default() -> Self {
        Self::new()
    }
}
