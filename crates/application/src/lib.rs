#![forbid(unsafe_code)]

pub mod chain_swapper;
pub mod conntrack_clock;
pub mod counters;
pub mod iptables_service_impl;
