use ports::secondary::conntrack_port::ConntrackStatusPort;

/// Connection tracking availability decided by configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticConntrackStatus {
    active: bool,
}

impl StaticConntrackStatus {
    pub fn new(active: bool) -> Self {
        Self { active }
    }
}

impl ConntrackStatusPort for StaticConntrackStatus {
    fn is_active(&self) -> bool {
        self.active
    }
}
