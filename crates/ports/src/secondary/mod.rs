pub mod conntrack_port;
pub mod interface_port;
pub mod metrics_port;
pub mod program_loader_port;
