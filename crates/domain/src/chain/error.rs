use thiserror::Error;

use crate::common::entity::ChainName;
use crate::common::error::DomainError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid CIDR '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("invalid TCP flags '{value}': {reason}")]
    InvalidTcpFlags { value: String, reason: String },

    #[error("invalid port {port}: must be 1-65535")]
    InvalidPort { port: u16 },

    #[error("{0}")]
    InvalidValue(String),

    #[error("unknown interface '{name}'")]
    UnknownInterface { name: String },

    #[error("{field} cannot be used in chain {chain}")]
    InterfaceDirection { chain: ChainName, field: &'static str },

    #[error("rule requires connection tracking, which is not active")]
    ConntrackInactive,

    #[error("chain {chain} is full ({max} rules)")]
    TooManyRules { chain: ChainName, max: usize },

    #[error("no matching rule to delete in chain {chain}")]
    RuleNotFound { chain: ChainName },

    #[error("insert position {id} out of range for chain {chain} ({len} rules)")]
    InsertOutOfRange { chain: ChainName, id: usize, len: usize },

    #[error("chain {chain} already exists")]
    DuplicateChain { chain: ChainName },

    #[error("chain {chain} does not exist")]
    UnknownChain { chain: ChainName },
}

impl From<ChainError> for DomainError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::ConntrackInactive => DomainError::Dependency(e.to_string()),
            ChainError::TooManyRules { .. } => DomainError::ResourceExhausted(e.to_string()),
            ChainError::RuleNotFound { .. } | ChainError::UnknownChain { .. } => {
                DomainError::RuleNotFound(e.to_string())
            }
            ChainError::DuplicateChain { .. } => DomainError::Conflict(e.to_string()),
            other => DomainError::InvalidRule(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorKind;

    #[test]
    fn maps_to_domain_kinds() {
        let cases = [
            (ChainError::ConntrackInactive, ErrorKind::Dependency),
            (
                ChainError::TooManyRules {
                    chain: ChainName::Input,
                    max: 1,
                },
                ErrorKind::ResourceExhausted,
            ),
            (
                ChainError::RuleNotFound {
                    chain: ChainName::Output,
                },
                ErrorKind::NotFound,
            ),
            (
                ChainError::DuplicateChain {
                    chain: ChainName::Forward,
                },
                ErrorKind::Conflict,
            ),
            (
                ChainError::UnknownInterface {
                    name: "nope0".to_string(),
                },
                ErrorKind::Validation,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(DomainError::from(err).kind(), kind);
        }
    }
}
