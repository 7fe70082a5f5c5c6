use domain::chain::entity::RuleSpec;
use domain::common::entity::{ChainName, RuleAction};
use domain::common::error::DomainError;
use domain::pipeline::entity::PacketCounters;

/// Operations offered to the configuration layer and to telemetry.
///
/// Mutations return the affected rule id where one exists. In
/// interactive mode every successful mutation rebuilds the affected
/// chain once; a `DomainError::RebuildFailed` means the rule list was
/// changed but the previous pipeline is still serving.
pub trait IptablesService: Send + Sync {
    fn append_rule(&mut self, chain: ChainName, rule: &RuleSpec) -> Result<usize, DomainError>;

    fn insert_rule(
        &mut self,
        chain: ChainName,
        id: usize,
        rule: &RuleSpec,
    ) -> Result<usize, DomainError>;

    /// Delete the first rule equal to `rule`.
    fn delete_rule(&mut self, chain: ChainName, rule: &RuleSpec) -> Result<usize, DomainError>;

    fn set_default_action(
        &mut self,
        chain: ChainName,
        action: RuleAction,
    ) -> Result<(), DomainError>;

    /// Batch mode defers rebuilds to `apply_rules`.
    fn set_interactive(&mut self, interactive: bool);

    /// Rebuild every chain changed since the last rebuild.
    fn apply_rules(&mut self) -> Result<(), DomainError>;

    fn reset_counters(&mut self, chain: ChainName) -> Result<(), DomainError>;

    /// Totals for a rule. Reading flushes the datapath counters into
    /// the service's ledger.
    fn rule_counters(&self, chain: ChainName, id: usize) -> Result<PacketCounters, DomainError>;

    fn default_action_counters(&self, chain: ChainName) -> Result<PacketCounters, DomainError>;

    fn rule_count(&self, chain: ChainName) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iptables_service_is_object_safe() {
        fn _check(service: &dyn IptablesService) {
            let _ = service.rule_count(ChainName::Input);
            let _ = service.default_action_counters(ChainName::Output);
        }
    }
}
