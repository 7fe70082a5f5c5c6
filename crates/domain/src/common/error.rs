use thiserror::Error;

use super::entity::ChainName;

/// Failure classes callers need to tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Dependency,
    ResourceExhausted,
    RebuildFailure,
    Engine,
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unmet dependency: {0}")]
    Dependency(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The rule list changed but the pipeline stayed on its previous
    /// generation.
    #[error("pipeline rebuild failed for chain {chain}: {reason}")]
    RebuildFailed { chain: ChainName, reason: String },

    #[error("engine error: {0}")]
    EngineError(String),
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RuleNotFound(_) => ErrorKind::NotFound,
            Self::InvalidRule(_) | Self::InvalidConfig(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Dependency(_) => ErrorKind::Dependency,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::RebuildFailed { .. } => ErrorKind::RebuildFailure,
            Self::EngineError(_) => ErrorKind::Engine,
        }
    }

    /// `true` when the mutation was applied to the rule list but the
    /// active pipeline was left unchanged.
    pub fn is_rebuild_failure(&self) -> bool {
        matches!(self, Self::RebuildFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_failure_is_distinguishable() {
        let err = DomainError::RebuildFailed {
            chain: ChainName::Input,
            reason: "load failed".to_string(),
        };
        assert!(err.is_rebuild_failure());
        assert_eq!(err.kind(), ErrorKind::RebuildFailure);
        assert!(err.to_string().contains("INPUT"));

        let other = DomainError::InvalidRule("bad".to_string());
        assert!(!other.is_rebuild_failure());
        assert_eq!(other.kind(), ErrorKind::Validation);
    }
}
