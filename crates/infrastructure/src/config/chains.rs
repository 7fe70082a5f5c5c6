//! Per-chain policy and rule lists.

use domain::chain::entity::{ChainRule, RuleSpec};
use domain::common::entity::{ChainName, RuleAction};
use serde::{Deserialize, Serialize};

use super::common::{ConfigError, check_limit};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainsConfig {
    #[serde(default)]
    pub input: ChainConfig,

    #[serde(default)]
    pub forward: ChainConfig,

    #[serde(default)]
    pub output: ChainConfig,
}

impl ChainsConfig {
    pub fn get(&self, chain: ChainName) -> &ChainConfig {
        match chain {
            ChainName::Input => &self.input,
            ChainName::Forward => &self.forward,
            ChainName::Output => &self.output,
        }
    }

    /// Default policies in `[INPUT, FORWARD, OUTPUT]` order.
    pub fn defaults(&self) -> [RuleAction; 3] {
        ChainName::ALL.map(|chain| self.get(chain).default)
    }

    pub(super) fn validate(&self, max_rules: usize) -> Result<(), ConfigError> {
        for chain in ChainName::ALL {
            self.get(chain).validate(chain, max_rules)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    #[serde(default = "default_policy")]
    pub default: RuleAction,

    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            default: default_policy(),
            rules: Vec::new(),
        }
    }
}

fn default_policy() -> RuleAction {
    RuleAction::Accept
}

impl ChainConfig {
    fn validate(&self, chain: ChainName, max_rules: usize) -> Result<(), ConfigError> {
        let section = section_name(chain);
        check_limit(&format!("{section}.rules"), self.rules.len(), max_rules)?;
        for idx in 0..self.rules.len() {
            self.rule(chain, idx)?;
        }
        Ok(())
    }

    /// Parse rule `idx` and check it is legal in `chain`. Interface names
    /// stay unresolved.
    pub fn rule(&self, chain: ChainName, idx: usize) -> Result<ChainRule, ConfigError> {
        let field = format!("{}.rules[{idx}]", section_name(chain));
        let spec = self
            .rules
            .get(idx)
            .ok_or_else(|| ConfigError::validation(&field, "no such rule"))?;
        let rule = spec
            .to_rule()
            .map_err(|e| ConfigError::validation(&field, e.to_string()))?;
        rule.validate_for(chain)
            .map_err(|e| ConfigError::validation(&field, e.to_string()))?;
        Ok(rule)
    }
}

fn section_name(chain: ChainName) -> String {
    format!("chains.{}", chain.as_str().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(yaml: &str) -> ChainConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn policy_defaults_to_accept() {
        let c = chain("rules: []");
        assert_eq!(c.default, RuleAction::Accept);
        assert!(ChainsConfig::default().defaults().iter().all(|a| *a == RuleAction::Accept));
    }

    #[test]
    fn rule_errors_name_their_position() {
        let c = chain(
            r"
default: drop
rules:
  - { dport: 22, l4proto: tcp, action: accept }
  - { src: 10.0.0.0/33 }
",
        );
        assert!(c.rule(ChainName::Input, 0).is_ok());
        let err = c.validate(ChainName::Input, 10).unwrap_err();
        assert!(err.to_string().contains("chains.input.rules[1]"));
    }

    #[test]
    fn out_iface_is_only_legal_on_output() {
        let c = chain("rules: [ { out_iface: eth0 } ]");
        assert!(c.validate(ChainName::Input, 10).is_err());
        assert!(c.validate(ChainName::Forward, 10).is_err());
        assert!(c.validate(ChainName::Output, 10).is_ok());
    }

    #[test]
    fn rule_count_is_limited() {
        let c = chain("rules: [ {}, {}, {} ]");
        let err = c.validate(ChainName::Output, 2).unwrap_err();
        assert!(err.to_string().contains("chains.output.rules"));
    }

    #[test]
    fn unknown_rule_field_fails_to_parse() {
        assert!(serde_yaml_ng::from_str::<ChainConfig>("rules: [ { port: 22 } ]").is_err());
    }
}
