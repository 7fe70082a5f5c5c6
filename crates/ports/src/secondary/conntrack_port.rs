/// Connection-tracking collaborator.
pub trait ConntrackStatusPort: Send + Sync {
    /// `true` when the conntrack programs are installed and tracking
    /// connections, so rules may match on connection state.
    fn is_active(&self) -> bool;
}
