use std::collections::BTreeMap;

use ebpf_common::pipeline::MAX_RULES;

use crate::common::entity::{ChainName, RuleAction};

use super::entity::ChainRule;
use super::error::ChainError;

/// Ordered rule list of one chain. A rule's id is its current
/// position: inserting shifts later rules down, deleting compacts.
#[derive(Debug, Clone)]
pub struct Chain {
    name: ChainName,
    rules: Vec<ChainRule>,
    default_action: RuleAction,
    accept_established: bool,
    max_rules: usize,
}

impl Chain {
    /// `max_rules` is clamped to `MAX_RULES`.
    pub fn new(name: ChainName, default_action: RuleAction, max_rules: usize) -> Self {
        Self {
            name,
            rules: Vec::new(),
            default_action,
            accept_established: false,
            max_rules: max_rules.min(MAX_RULES as usize),
        }
    }

    pub fn name(&self) -> ChainName {
        self.name
    }

    pub fn rules(&self) -> &[ChainRule] {
        &self.rules
    }

    pub fn rule(&self, id: usize) -> Option<&ChainRule> {
        self.rules.get(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn max_rules(&self) -> usize {
        self.max_rules
    }

    pub fn default_action(&self) -> RuleAction {
        self.default_action
    }

    pub fn accept_established(&self) -> bool {
        self.accept_established
    }

    /// Append at the end. Returns the new rule's id.
    pub fn append(&mut self, rule: ChainRule) -> Result<usize, ChainError> {
        self.check_insertable(&rule)?;
        self.rules.push(rule);
        Ok(self.rules.len() - 1)
    }

    /// Insert at `id`; `id == len` appends.
    pub fn insert(&mut self, id: usize, rule: ChainRule) -> Result<usize, ChainError> {
        if id > self.rules.len() {
            return Err(ChainError::InsertOutOfRange {
                chain: self.name,
                id,
                len: self.rules.len(),
            });
        }
        self.check_insertable(&rule)?;
        self.rules.insert(id, rule);
        Ok(id)
    }

    /// Remove the first rule equal to `rule`. Returns its former id.
    pub fn delete_matching(&mut self, rule: &ChainRule) -> Result<usize, ChainError> {
        let id = self
            .rules
            .iter()
            .position(|r| r == rule)
            .ok_or(ChainError::RuleNotFound { chain: self.name })?;
        self.rules.remove(id);
        Ok(id)
    }

    /// Returns `true` if the default action changed.
    pub fn set_default(&mut self, action: RuleAction) -> bool {
        let changed = self.default_action != action;
        self.default_action = action;
        changed
    }

    /// Returns `true` if the flag changed.
    pub fn set_accept_established(&mut self, enabled: bool) -> bool {
        let changed = self.accept_established != enabled;
        self.accept_established = enabled;
        changed
    }

    // ── Private helpers ────────────────────────────────────────────────

    fn check_insertable(&self, rule: &ChainRule) -> Result<(), ChainError> {
        rule.validate_for(self.name)?;
        if self.rules.len() >= self.max_rules {
            return Err(ChainError::TooManyRules {
                chain: self.name,
                max: self.max_rules,
            });
        }
        Ok(())
    }
}

/// Exactly one `Chain` per name.
#[derive(Debug, Clone, Default)]
pub struct ChainSet {
    chains: BTreeMap<ChainName, Chain>,
}

impl ChainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// All three chains with empty rule lists.
    pub fn with_defaults(
        input: RuleAction,
        forward: RuleAction,
        output: RuleAction,
        max_rules: usize,
    ) -> Self {
        let mut set = Self::new();
        for (name, action) in [
            (ChainName::Input, input),
            (ChainName::Forward, forward),
            (ChainName::Output, output),
        ] {
            set.chains.insert(name, Chain::new(name, action, max_rules));
        }
        set
    }

    pub fn create(
        &mut self,
        name: ChainName,
        default_action: RuleAction,
        max_rules: usize,
    ) -> Result<&mut Chain, ChainError> {
        if self.chains.contains_key(&name) {
            return Err(ChainError::DuplicateChain { chain: name });
        }
        Ok(self
            .chains
            .entry(name)
            .or_insert_with(|| Chain::new(name, default_action, max_rules)))
    }

    pub fn get(&self, name: ChainName) -> Result<&Chain, ChainError> {
        self.chains
            .get(&name)
            .ok_or(ChainError::UnknownChain { chain: name })
    }

    pub fn get_mut(&mut self, name: ChainName) -> Result<&mut Chain, ChainError> {
        self.chains
            .get_mut(&name)
            .ok_or(ChainError::UnknownChain { chain: name })
    }

    pub fn len_of(&self, name: ChainName) -> usize {
        self.chains.get(&name).map_or(0, Chain::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chain> {
        self.chains.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::ConntrackStatus;

    fn port_rule(port: u16, action: RuleAction) -> ChainRule {
        ChainRule {
            dport: Some(port),
            action,
            ..ChainRule::default()
        }
    }

    #[test]
    fn append_assigns_positions() {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 16);
        assert_eq!(chain.append(port_rule(22, RuleAction::Accept)).unwrap(), 0);
        assert_eq!(chain.append(port_rule(80, RuleAction::Accept)).unwrap(), 1);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn insert_shifts_later_rules() {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 16);
        chain.append(port_rule(22, RuleAction::Accept)).unwrap();
        chain.append(port_rule(80, RuleAction::Accept)).unwrap();
        chain.insert(1, port_rule(443, RuleAction::Drop)).unwrap();
        let ports: Vec<_> = chain.rules().iter().map(|r| r.dport.unwrap()).collect();
        assert_eq!(ports, vec![22, 443, 80]);
    }

    #[test]
    fn insert_past_end_is_rejected() {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 16);
        let err = chain.insert(1, port_rule(22, RuleAction::Accept)).unwrap_err();
        assert!(matches!(err, ChainError::InsertOutOfRange { id: 1, len: 0, .. }));
        assert!(chain.is_empty());
    }

    #[test]
    fn delete_matching_removes_first_equal_rule() {
        let mut chain = Chain::new(ChainName::Output, RuleAction::Accept, 16);
        chain.append(port_rule(22, RuleAction::Accept)).unwrap();
        chain.append(port_rule(80, RuleAction::Drop)).unwrap();
        chain.append(port_rule(80, RuleAction::Drop)).unwrap();
        assert_eq!(chain.delete_matching(&port_rule(80, RuleAction::Drop)).unwrap(), 1);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn delete_without_match_fails() {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 16);
        chain.append(port_rule(22, RuleAction::Accept)).unwrap();
        let err = chain
            .delete_matching(&port_rule(22, RuleAction::Drop))
            .unwrap_err();
        assert!(err.to_string().contains("no matching rule to delete"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 2);
        chain.append(port_rule(1, RuleAction::Drop)).unwrap();
        chain.append(port_rule(2, RuleAction::Drop)).unwrap();
        let err = chain.append(port_rule(3, RuleAction::Drop)).unwrap_err();
        assert!(matches!(err, ChainError::TooManyRules { max: 2, .. }));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn max_rules_is_clamped() {
        let chain = Chain::new(ChainName::Input, RuleAction::Accept, 1_000_000);
        assert_eq!(chain.max_rules(), MAX_RULES as usize);
    }

    #[test]
    fn set_default_reports_change() {
        let mut chain = Chain::new(ChainName::Forward, RuleAction::Drop, 16);
        assert!(!chain.set_default(RuleAction::Drop));
        assert!(chain.set_default(RuleAction::Accept));
        assert_eq!(chain.default_action(), RuleAction::Accept);
    }

    #[test]
    fn chain_set_rejects_duplicates() {
        let mut set = ChainSet::new();
        set.create(ChainName::Input, RuleAction::Accept, 16).unwrap();
        let err = set
            .create(ChainName::Input, RuleAction::Drop, 16)
            .unwrap_err();
        assert!(matches!(err, ChainError::DuplicateChain { .. }));
        assert_eq!(
            set.get(ChainName::Input).unwrap().default_action(),
            RuleAction::Accept
        );
        assert!(set.get(ChainName::Output).is_err());
    }

    #[test]
    fn rules_with_conntrack_are_stored_as_is() {
        let mut set =
            ChainSet::with_defaults(RuleAction::Accept, RuleAction::Drop, RuleAction::Accept, 8);
        let chain = set.get_mut(ChainName::Input).unwrap();
        chain
            .append(ChainRule {
                conntrack: Some(ConntrackStatus::Established),
                ..ChainRule::default()
            })
            .unwrap();
        assert_eq!(set.len_of(ChainName::Input), 1);
        assert_eq!(set.len_of(ChainName::Forward), 0);
    }
}
