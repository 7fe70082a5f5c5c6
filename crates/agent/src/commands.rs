use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use adapters::memory::substrate::MemorySubstrate;
use adapters::system::interfaces::SysfsInterfaceResolver;
use application::iptables_service_impl::IptablesAppService;
use domain::common::entity::ChainName;
use infrastructure::config::AgentConfig;
use infrastructure::metrics::AgentMetrics;
use ports::primary::iptables_service::IptablesService;
use ports::secondary::interface_port::InterfaceResolverPort;

use crate::cli::Cli;
use crate::startup::{build_service, provision};

pub fn cmd_version() {
    println!("chainfilter-agent {}", env!("CARGO_PKG_VERSION"));
}

/// Parse, validate and compile the config on the in-memory substrate.
pub fn cmd_check(cli: &Cli) -> anyhow::Result<()> {
    let config = AgentConfig::load(Path::new(&cli.config))?;
    let report = check_config(&config, Arc::new(SysfsInterfaceResolver::new()))?;
    println!("config OK: {}", cli.config);
    print!("{report}");
    Ok(())
}

pub(crate) fn check_config(
    config: &AgentConfig,
    interfaces: Arc<dyn InterfaceResolverPort>,
) -> anyhow::Result<String> {
    let mut service = build_service(
        config,
        Arc::new(MemorySubstrate::new()),
        interfaces,
        Arc::new(AgentMetrics::new()),
    );
    let provisioned = provision(&mut service, config);
    let report = provisioned.map(|()| render_report(&service));
    service.shutdown();
    report
}

fn render_report(service: &IptablesAppService) -> String {
    let mut out = String::new();
    for chain in ChainName::ALL {
        let default = service
            .default_action(chain)
            .map_or_else(|e| e.to_string(), |a| a.to_string());
        let _ = write!(
            out,
            "{:<8} default={default} rules={}",
            chain.as_str(),
            service.rule_count(chain)
        );
        if chain == ChainName::Input {
            let _ = write!(out, " fast-path={}", service.horus_rules());
        }
        let _ = writeln!(
            out,
            " accept-established={}",
            if service.accept_established(chain) { "yes" } else { "no" }
        );
        let summary = service.pipeline_summary(chain);
        if summary.is_empty() {
            let _ = writeln!(out, "  pipeline: (default action only)");
        } else {
            let _ = writeln!(out, "  pipeline: {summary}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::system::interfaces::StaticInterfaceResolver;

    fn resolver() -> Arc<dyn InterfaceResolverPort> {
        Arc::new(StaticInterfaceResolver::new([("eth0", 2)]))
    }

    #[test]
    fn report_lists_every_chain() {
        let yaml = r"
agent:
  interfaces: [eth0]
chains:
  input:
    default: drop
    rules:
      - { dport: 22, l4proto: tcp, action: accept }
  output:
    rules:
      - { conntrack: established, action: accept }
";
        let config = AgentConfig::from_yaml(yaml).unwrap();
        let report = check_config(&config, resolver()).unwrap();

        assert!(report.contains("INPUT    default=DROP rules=1 fast-path=1"));
        assert!(report.contains("FORWARD  default=ACCEPT rules=0"));
        assert!(report.contains("OUTPUT   default=ACCEPT rules=1 accept-established=yes"));
        assert!(report.contains("(default action only)"));
    }

    #[test]
    fn conntrack_rules_need_conntrack() {
        let yaml = r"
agent:
  interfaces: [eth0]
filter:
  conntrack: false
chains:
  input:
    rules:
      - { conntrack: new, action: accept }
";
        let config = AgentConfig::from_yaml(yaml).unwrap();
        let err = check_config(&config, resolver()).unwrap_err();
        assert!(format!("{err:#}").contains("chains.input.rules[0]"));
    }
}
