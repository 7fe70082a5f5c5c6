use domain::common::error::DomainError;

/// Resolves interface names to the numeric index the datapath sees.
pub trait InterfaceResolverPort: Send + Sync {
    /// Returns `DomainError::InvalidRule` for an unknown name.
    fn index_of(&self, name: &str) -> Result<u32, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_port_is_object_safe() {
        fn _check(port: &dyn InterfaceResolverPort) {
            let _ = port.index_of("eth0");
        }
    }
}
