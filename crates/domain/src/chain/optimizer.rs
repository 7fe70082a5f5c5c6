use super::entity::ChainRule;
use super::store::Chain;

/// Detects the "rule 0 accepts every ESTABLISHED connection" pattern.
pub struct AcceptEstablishedOptimizer;

impl AcceptEstablishedOptimizer {
    pub fn detect(rules: &[ChainRule]) -> bool {
        rules
            .first()
            .is_some_and(|r| *r == ChainRule::accept_established())
    }

    /// Re-evaluate the chain's flag. Returns the new value when it
    /// changed, `None` when it was already correct.
    pub fn apply(chain: &mut Chain) -> Option<bool> {
        let wanted = Self::detect(chain.rules());
        chain.set_accept_established(wanted).then_some(wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::{ChainName, ConntrackStatus, RuleAction};

    #[test]
    fn detects_exact_pattern_only() {
        assert!(AcceptEstablishedOptimizer::detect(&[
            ChainRule::accept_established()
        ]));
        assert!(!AcceptEstablishedOptimizer::detect(&[]));

        let with_port = ChainRule {
            dport: Some(22),
            ..ChainRule::accept_established()
        };
        assert!(!AcceptEstablishedOptimizer::detect(&[with_port]));

        let dropping = ChainRule {
            conntrack: Some(ConntrackStatus::Established),
            action: RuleAction::Drop,
            ..ChainRule::default()
        };
        assert!(!AcceptEstablishedOptimizer::detect(&[dropping]));
    }

    #[test]
    fn only_rule_zero_counts() {
        let rules = [
            ChainRule {
                dport: Some(22),
                ..ChainRule::default()
            },
            ChainRule::accept_established(),
        ];
        assert!(!AcceptEstablishedOptimizer::detect(&rules));
    }

    #[test]
    fn apply_is_idempotent() {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Drop, 16);
        chain.append(ChainRule::accept_established()).unwrap();
        assert_eq!(AcceptEstablishedOptimizer::apply(&mut chain), Some(true));
        assert_eq!(AcceptEstablishedOptimizer::apply(&mut chain), None);
        assert!(chain.accept_established());

        chain.insert(0, ChainRule::default()).unwrap();
        assert_eq!(AcceptEstablishedOptimizer::apply(&mut chain), Some(false));
        assert_eq!(AcceptEstablishedOptimizer::apply(&mut chain), None);
    }
}
