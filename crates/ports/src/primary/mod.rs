pub mod iptables_service;
