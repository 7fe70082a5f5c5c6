use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use adapters::ebpf::EbpfSubstrate;
use adapters::http::{AppState, MetricsRenderer, run_http_server};
use adapters::memory::substrate::MemorySubstrate;
use adapters::system::conntrack::StaticConntrackStatus;
use adapters::system::interfaces::SysfsInterfaceResolver;
use anyhow::Context;
use application::conntrack_clock::run_conntrack_clock;
use application::iptables_service_impl::{IptablesAppService, IptablesSettings};
use domain::common::entity::ChainName;
use infrastructure::config::{AgentConfig, SubstrateMode};
use infrastructure::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use infrastructure::logging::init_logging;
use infrastructure::metrics::AgentMetrics;
use ports::primary::iptables_service::IptablesService;
use ports::secondary::interface_port::InterfaceResolverPort;
use ports::secondary::metrics_port::MetricsPort;
use ports::secondary::program_loader_port::ProgramLoaderPort;
use tracing::{info, warn};

use crate::cli::Cli;

/// Service settings derived from the `filter` and `chains` sections.
pub(crate) fn settings_from(config: &AgentConfig) -> IptablesSettings {
    IptablesSettings {
        max_rules: config.filter.max_rules,
        interactive: config.filter.interactive,
        horus: config.filter.horus,
        defaults: config.chains.defaults(),
    }
}

/// Build the service over `loader` with the configured collaborators.
pub(crate) fn build_service(
    config: &AgentConfig,
    loader: Arc<dyn ProgramLoaderPort>,
    interfaces: Arc<dyn InterfaceResolverPort>,
    metrics: Arc<dyn MetricsPort>,
) -> IptablesAppService {
    IptablesAppService::new(
        &settings_from(config),
        loader,
        interfaces,
        Arc::new(StaticConntrackStatus::new(config.filter.conntrack)),
        metrics,
    )
}

/// Load the entry programs, then install every configured rule with a
/// single rebuild per chain.
pub(crate) fn provision(
    service: &mut IptablesAppService,
    config: &AgentConfig,
) -> anyhow::Result<()> {
    service.start().context("loading entry programs")?;

    service.set_interactive(false);
    for chain in ChainName::ALL {
        let section = chain.as_str().to_ascii_lowercase();
        for (idx, spec) in config.chains.get(chain).rules.iter().enumerate() {
            service
                .append_rule(chain, spec)
                .with_context(|| format!("chains.{section}.rules[{idx}]"))?;
        }
    }
    service.apply_rules().context("compiling configured chains")?;
    service.set_interactive(config.filter.interactive);
    Ok(())
}

fn build_loader(config: &AgentConfig) -> Arc<dyn ProgramLoaderPort> {
    match config.substrate.mode {
        SubstrateMode::Ebpf => {
            info!(
                object_dir = %config.substrate.object_dir.display(),
                pin_path = %config.substrate.pin_path.display(),
                interfaces = ?config.agent.interfaces,
                "using eBPF substrate"
            );
            Arc::new(EbpfSubstrate::new(
                &config.substrate.object_dir,
                &config.substrate.pin_path,
                config.agent.interfaces.clone(),
            ))
        }
        SubstrateMode::Memory => {
            warn!("using in-memory substrate, no traffic is filtered");
            Arc::new(MemorySubstrate::new())
        }
    }
}

/// Run the agent startup sequence and block until shutdown.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    // ── 1. Load config ──────────────────────────────────────────────
    let config = AgentConfig::load(Path::new(&cli.config))?;

    // ── 2. Initialize logging ───────────────────────────────────────
    // CLI flags take precedence over config file
    let log_level = cli.log_level.unwrap_or(config.agent.log_level);
    let log_format = cli.log_format.unwrap_or(config.agent.log_format);
    init_logging(log_level, log_format)?;

    let _root_span = tracing::span!(
        tracing::Level::INFO,
        "service",
        service.name = "chainfilter",
        service.version = env!("CARGO_PKG_VERSION"),
    )
    .entered();

    info!(
        config_path = %cli.config,
        log_level = log_level.as_str(),
        log_format = log_format.as_str(),
        "chainfilter agent starting"
    );

    // ── 3. Build and provision the filter ───────────────────────────
    let metrics = Arc::new(AgentMetrics::new());
    let mut service = build_service(
        &config,
        build_loader(&config),
        Arc::new(SysfsInterfaceResolver::new()),
        Arc::clone(&metrics) as Arc<dyn MetricsPort>,
    );
    if let Err(e) = provision(&mut service, &config) {
        service.shutdown();
        return Err(e);
    }
    for chain in ChainName::ALL {
        info!(
            chain = %chain,
            rules = service.rule_count(chain),
            pipeline = %service.pipeline_summary(chain),
            "chain ready"
        );
    }
    let programs_loaded = Arc::new(AtomicBool::new(true));

    // ── 4. Create cancellation token ────────────────────────────────
    let cancel_token = crate::shutdown::create_shutdown_token();

    // ── 5. Spawn conntrack clock ────────────────────────────────────
    let clock_table = service.conntrack_clock_table()?;
    let clock_handle = tokio::spawn(run_conntrack_clock(
        clock_table,
        config.conntrack_clock_interval(),
        cancel_token.clone(),
    ));

    // ── 6. Spawn metrics endpoint ───────────────────────────────────
    let http_handle = config.agent.metrics_port.map(|port| {
        let render_metrics: MetricsRenderer = {
            let metrics = Arc::clone(&metrics);
            Arc::new(move || metrics.encode())
        };
        let state = Arc::new(AppState::new(render_metrics, Arc::clone(&programs_loaded)));
        let bind = config.agent.bind_address.clone();
        let shutdown = cancel_token.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_http_server(state, &bind, port, shutdown.cancelled_owned()).await
            {
                tracing::error!(error = %e, "metrics server failed");
            }
        })
    });

    // ── 7. Ready, wait for cancellation ─────────────────────────────
    info!("agent ready, waiting for shutdown signal");
    cancel_token.cancelled().await;

    // ── 8. Ordered shutdown sequence ────────────────────────────────
    info!("shutdown phase 1: stopping background tasks");
    let _ = tokio::time::timeout(Duration::from_secs(1), clock_handle).await;
    if let Some(handle) = http_handle {
        let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await;
    }

    info!("shutdown phase 2: unloading programs");
    programs_loaded.store(false, Ordering::Relaxed);
    service.shutdown();

    info!("agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::system::interfaces::StaticInterfaceResolver;
    use domain::common::entity::RuleAction;

    const CONFIG: &str = r"
agent:
  interfaces: [eth0]
filter:
  interactive: false
  horus: false
chains:
  input:
    default: drop
    rules:
      - { dport: 22, l4proto: tcp, action: accept }
      - { in_iface: eth0, src: 192.168.0.0/16, action: accept }
  output:
    rules:
      - { dst: 10.0.0.1 }
";

    fn service(config: &AgentConfig) -> IptablesAppService {
        build_service(
            config,
            Arc::new(MemorySubstrate::new()),
            Arc::new(StaticInterfaceResolver::new([("eth0", 2)])),
            Arc::new(AgentMetrics::new()),
        )
    }

    #[test]
    fn settings_follow_config() {
        let config = AgentConfig::from_yaml(CONFIG).unwrap();
        let settings = settings_from(&config);
        assert!(!settings.interactive);
        assert!(!settings.horus);
        assert_eq!(
            settings.defaults,
            [RuleAction::Drop, RuleAction::Accept, RuleAction::Accept]
        );
    }

    #[test]
    fn provision_installs_every_chain() {
        let config = AgentConfig::from_yaml(CONFIG).unwrap();
        let mut svc = service(&config);
        provision(&mut svc, &config).unwrap();

        assert_eq!(svc.rule_count(ChainName::Input), 2);
        assert_eq!(svc.rule_count(ChainName::Forward), 0);
        assert_eq!(svc.rule_count(ChainName::Output), 1);
        assert!(svc.pending_chains().is_empty());
        assert!(svc.pipeline_entry(ChainName::Input).is_some());
        assert!(svc.pipeline_entry(ChainName::Forward).is_none());
        assert!(!svc.is_interactive());
        svc.shutdown();
    }

    #[test]
    fn provision_reports_unresolvable_interface() {
        let yaml = r"
agent:
  interfaces: [eth0]
chains:
  forward:
    rules:
      - { in_iface: wg0, action: accept }
";
        let config = AgentConfig::from_yaml(yaml).unwrap();
        let mut svc = service(&config);
        let err = provision(&mut svc, &config).unwrap_err();
        assert!(format!("{err:#}").contains("chains.forward.rules[0]"));
    }
}
