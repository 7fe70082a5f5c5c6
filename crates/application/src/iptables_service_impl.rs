use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use domain::chain::entity::{ChainRule, RuleSpec};
use domain::chain::error::ChainError;
use domain::chain::optimizer::AcceptEstablishedOptimizer;
use domain::chain::store::ChainSet;
use domain::common::entity::{ChainName, Hook, RuleAction};
use domain::common::error::DomainError;
use domain::horus::compiler::HorusCompiler;
use domain::pipeline::builder::{PipelineBuilder, describe};
use domain::pipeline::entity::PacketCounters;
use ebpf_common::pipeline::{
    CONNTRACK_MODE_DISABLED, CONNTRACK_MODE_OFF, CONNTRACK_MODE_ON, SLOT_CHAIN_FORWARDER,
    SLOT_CHAIN_SELECTOR, SLOT_CONNTRACK_LABEL, SLOT_CONNTRACK_TABLE_UPDATE, SLOT_PARSER,
    TABLE_ACCEPT_ESTABLISHED_BYTES, TABLE_ACCEPT_ESTABLISHED_PKTS, TABLE_DEFAULT_BYTES,
    TABLE_DEFAULT_PKTS, TABLE_TIMESTAMP,
};
use ports::primary::iptables_service::IptablesService;
use ports::secondary::conntrack_port::ConntrackStatusPort;
use ports::secondary::interface_port::InterfaceResolverPort;
use ports::secondary::metrics_port::MetricsPort;
use ports::secondary::program_loader_port::{
    PerChain, Program, ProgramHandle, ProgramLoaderPort, ProgramSpec, TableHandle,
};
use tracing::{debug, error, info, warn};

use crate::chain_swapper::{
    ChainSwapper, HorusGeneration, PipelineGeneration, SwapState, drain_entry,
};
use crate::counters::CounterLedger;

const HOOKS: [Hook; 2] = [Hook::Ingress, Hook::Egress];

/// Startup parameters of the service.
#[derive(Debug, Clone)]
pub struct IptablesSettings {
    pub max_rules: usize,
    pub interactive: bool,
    pub horus: bool,
    pub defaults: PerChain<RuleAction>,
}

impl Default for IptablesSettings {
    fn default() -> Self {
        Self {
            max_rules: ebpf_common::pipeline::MAX_RULES as usize,
            interactive: true,
            horus: true,
            defaults: [RuleAction::Accept; 3],
        }
    }
}

// ── Entry programs ──────────────────────────────────────────────────

/// Everything the fixed entry programs are generated from.
#[derive(Debug, Clone)]
struct EntryPoints {
    defaults: PerChain<RuleAction>,
    rule_counts: PerChain<u32>,
    entries: PerChain<Option<u16>>,
    conntrack_modes: PerChain<u8>,
    horus_slot: Option<u16>,
}

impl EntryPoints {
    fn spec(hook: Hook, index: u16, program: Program) -> ProgramSpec {
        ProgramSpec {
            index,
            hook,
            program,
        }
    }

    fn parser(&self, hook: Hook) -> ProgramSpec {
        let horus_slot = match hook {
            Hook::Ingress => self.horus_slot,
            Hook::Egress => None,
        };
        Self::spec(hook, SLOT_PARSER, Program::Parser { horus_slot })
    }

    fn selector(&self, hook: Hook) -> ProgramSpec {
        let input = ChainName::Input.index() as usize;
        let forward = ChainName::Forward.index() as usize;
        let allow_all = hook == Hook::Ingress
            && self.defaults[input] == RuleAction::Accept
            && self.defaults[forward] == RuleAction::Accept
            && self.rule_counts[input] == 0
            && self.rule_counts[forward] == 0;
        Self::spec(
            hook,
            SLOT_CHAIN_SELECTOR,
            Program::ChainSelector {
                defaults: self.defaults,
                rule_counts: self.rule_counts,
                allow_all,
            },
        )
    }

    fn conntrack_label(&self, hook: Hook) -> ProgramSpec {
        Self::spec(
            hook,
            SLOT_CONNTRACK_LABEL,
            Program::ConntrackLabel {
                modes: self.conntrack_modes,
            },
        )
    }

    fn forwarder(&self, hook: Hook) -> ProgramSpec {
        Self::spec(
            hook,
            SLOT_CHAIN_FORWARDER,
            Program::ChainForwarder {
                entries: self.entries,
                defaults: self.defaults,
            },
        )
    }

    /// Fixed programs in load order: the parser goes last so traffic
    /// only enters once everything behind it exists.
    fn fixed(&self, hook: Hook) -> [ProgramSpec; 5] {
        [
            Self::spec(hook, SLOT_CONNTRACK_TABLE_UPDATE, Program::ConntrackTableUpdate),
            self.forwarder(hook),
            self.conntrack_label(hook),
            self.selector(hook),
            self.parser(hook),
        ]
    }
}

/// Repoint a hook's entry programs: forwarder, then selector, then parser.
fn wire(loader: &dyn ProgramLoaderPort, entry: &EntryPoints, hook: Hook) -> Result<(), DomainError> {
    loader.reload(&entry.forwarder(hook))?;
    loader.reload(&entry.selector(hook))?;
    loader.reload(&entry.parser(hook))
}

// ── Fixed program handles ───────────────────────────────────────────

#[derive(Default)]
struct FixedPrograms {
    handles: BTreeMap<(Hook, u16), Arc<dyn ProgramHandle>>,
    lock: Mutex<()>,
}

impl FixedPrograms {
    fn table(&self, hook: Hook, slot: u16, name: &str) -> Result<Arc<dyn TableHandle>, DomainError> {
        self.handles
            .get(&(hook, slot))
            .ok_or_else(|| {
                DomainError::EngineError(format!("entry program {slot}@{hook} is not loaded"))
            })?
            .table(name)
    }

    fn drain(
        &self,
        hook: Hook,
        slot: u16,
        pkts: &str,
        bytes: &str,
        index: u32,
    ) -> Result<PacketCounters, DomainError> {
        let _guard = lock(&self.lock);
        drain_entry(
            &*self.table(hook, slot, pkts)?,
            &*self.table(hook, slot, bytes)?,
            index,
        )
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move datapath counters of a generation into the ledger.
fn harvest(
    fixed: &FixedPrograms,
    ledger: &Mutex<CounterLedger>,
    chain: ChainName,
    pipeline: Option<&PipelineGeneration>,
    horus: Option<&HorusGeneration>,
) -> Result<(), DomainError> {
    let hook = chain.hook();
    let mut collected: Vec<(usize, PacketCounters)> = Vec::new();

    if let Some(generation) = pipeline {
        if let Some(stage) = generation.action_stage() {
            let counters = stage.drain_counters(generation.plan().rule_count)?;
            collected.extend(counters.into_iter().enumerate());
        }
        if generation.plan().rule_count > 0 && fixed.handles.contains_key(&(hook, SLOT_CONNTRACK_LABEL)) {
            let established = fixed.drain(
                hook,
                SLOT_CONNTRACK_LABEL,
                TABLE_ACCEPT_ESTABLISHED_PKTS,
                TABLE_ACCEPT_ESTABLISHED_BYTES,
                chain.index(),
            )?;
            collected.push((0, established));
        }
    }
    if let Some(horus) = horus {
        collected.extend(horus.drain_counters()?.into_iter().enumerate());
    }
    let default = if fixed.handles.contains_key(&(hook, SLOT_CHAIN_SELECTOR)) {
        fixed.drain(
            hook,
            SLOT_CHAIN_SELECTOR,
            TABLE_DEFAULT_PKTS,
            TABLE_DEFAULT_BYTES,
            chain.index(),
        )?
    } else {
        PacketCounters::default()
    };

    let mut ledger = lock(ledger);
    for (id, counters) in collected {
        ledger.add_generation(chain, id, counters);
    }
    ledger.add_default(chain, default);
    Ok(())
}

// ── Service ─────────────────────────────────────────────────────────

/// Application-level iptables service.
///
/// Owns the chain store and one `ChainSwapper` per chain. Every
/// mutation rebuilds the affected chain from scratch (interactive mode)
/// or marks it for `apply_rules` (batch mode). Callers serialize
/// mutations through `&mut self`; counter reads only need `&self`.
pub struct IptablesAppService {
    chains: ChainSet,
    swappers: [ChainSwapper; 3],
    fixed: FixedPrograms,
    ledger: Mutex<CounterLedger>,
    builder: PipelineBuilder,
    horus: HorusCompiler,
    horus_enabled: bool,
    interactive: bool,
    dirty: BTreeSet<ChainName>,
    /// FORWARD had rules when INPUT was last built.
    input_saw_forward_rules: bool,
    loader: Arc<dyn ProgramLoaderPort>,
    interfaces: Arc<dyn InterfaceResolverPort>,
    conntrack: Arc<dyn ConntrackStatusPort>,
    metrics: Arc<dyn MetricsPort>,
}

impl IptablesAppService {
    pub fn new(
        settings: &IptablesSettings,
        loader: Arc<dyn ProgramLoaderPort>,
        interfaces: Arc<dyn InterfaceResolverPort>,
        conntrack: Arc<dyn ConntrackStatusPort>,
        metrics: Arc<dyn MetricsPort>,
    ) -> Self {
        let [input, forward, output] = settings.defaults;
        let chains = ChainSet::with_defaults(input, forward, output, settings.max_rules);
        let max_rules = chains
            .get(ChainName::Input)
            .map_or(settings.max_rules, |c| c.max_rules());
        Self {
            chains,
            swappers: ChainName::ALL.map(ChainSwapper::new),
            fixed: FixedPrograms::default(),
            ledger: Mutex::new(CounterLedger::new()),
            builder: PipelineBuilder::new(u32::try_from(max_rules).unwrap_or(u32::MAX)),
            horus: HorusCompiler::new(),
            horus_enabled: settings.horus,
            interactive: settings.interactive,
            dirty: BTreeSet::new(),
            input_saw_forward_rules: false,
            loader,
            interfaces,
            conntrack,
            metrics,
        }
    }

    /// Load the fixed entry programs on both hooks.
    pub fn start(&mut self) -> Result<(), DomainError> {
        let entry = self.entry_points();
        for hook in HOOKS {
            for spec in entry.fixed(hook) {
                let handle = self.loader.load(&spec)?;
                self.metrics.set_program_status(spec.program.name(), true);
                debug!(program = %spec, "entry program loaded");
                self.fixed.handles.insert((hook, spec.index), handle);
            }
        }
        info!(
            interactive = self.interactive,
            horus = self.horus_enabled,
            "entry programs loaded on ingress and egress"
        );
        for chain in ChainName::ALL {
            self.update_metrics(chain);
        }
        Ok(())
    }

    /// Unload every pipeline and entry program.
    pub fn shutdown(&mut self) {
        let entry = self.entry_points();
        for hook in HOOKS {
            for spec in entry.fixed(hook).iter().rev() {
                if self.fixed.handles.remove(&(hook, spec.index)).is_none() {
                    continue;
                }
                if let Err(e) = self.loader.unload(spec.index, hook) {
                    warn!("failed to unload entry program {spec}: {e}");
                }
                self.metrics.set_program_status(spec.program.name(), false);
            }
        }
        for swapper in &mut self.swappers {
            swapper.teardown(self.loader.as_ref());
        }
        info!("all programs unloaded");
    }

    /// Enable or disable the INPUT fast path.
    pub fn set_horus_enabled(&mut self, enabled: bool) -> Result<(), DomainError> {
        if self.horus_enabled == enabled {
            return Ok(());
        }
        self.horus_enabled = enabled;
        self.commit(ChainName::Input)
    }

    /// Timestamp table of the ingress connection-tracking updater.
    pub fn conntrack_clock_table(&self) -> Result<Arc<dyn TableHandle>, DomainError> {
        self.fixed
            .table(Hook::Ingress, SLOT_CONNTRACK_TABLE_UPDATE, TABLE_TIMESTAMP)
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn rules(&self, chain: ChainName) -> Result<&[ChainRule], DomainError> {
        Ok(self.chains.get(chain)?.rules())
    }

    pub fn default_action(&self, chain: ChainName) -> Result<RuleAction, DomainError> {
        Ok(self.chains.get(chain)?.default_action())
    }

    pub fn accept_established(&self, chain: ChainName) -> bool {
        self.chains
            .get(chain)
            .is_ok_and(domain::chain::store::Chain::accept_established)
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Number of INPUT rules answered by the fast path.
    pub fn horus_rules(&self) -> usize {
        self.swapper(ChainName::Input)
            .horus()
            .map_or(0, |h| h.table().covered_rules)
    }

    pub fn swap_state(&self, chain: ChainName) -> SwapState {
        self.swapper(chain).state()
    }

    /// Entry slot of the serving pipeline, `None` when the chain's
    /// default action applies directly.
    pub fn pipeline_entry(&self, chain: ChainName) -> Option<u16> {
        self.swapper(chain).entry()
    }

    pub fn pipeline_summary(&self, chain: ChainName) -> String {
        self.swapper(chain)
            .active()
            .map_or_else(String::new, |g| describe(g.plan()))
    }

    pub fn pending_chains(&self) -> Vec<ChainName> {
        self.dirty.iter().copied().collect()
    }

    // ── Private helpers ─────────────────────────────────────────────

    fn swapper(&self, chain: ChainName) -> &ChainSwapper {
        &self.swappers[chain.index() as usize]
    }

    fn entry_points(&self) -> EntryPoints {
        let mut entry = EntryPoints {
            defaults: [RuleAction::Accept; 3],
            rule_counts: [0; 3],
            entries: [None; 3],
            conntrack_modes: [CONNTRACK_MODE_DISABLED; 3],
            horus_slot: self
                .swapper(ChainName::Input)
                .horus()
                .map(|h| h.slot().index()),
        };
        let conntrack_active = self.conntrack.is_active();
        for chain in self.chains.iter() {
            let idx = chain.name().index() as usize;
            let swapper = self.swapper(chain.name());
            entry.defaults[idx] = chain.default_action();
            entry.entries[idx] = swapper.entry();
            entry.rule_counts[idx] = swapper.active().map_or(0, |g| {
                u32::try_from(g.plan().rule_count).unwrap_or(u32::MAX)
            });
            entry.conntrack_modes[idx] = match (conntrack_active, chain.accept_established()) {
                (false, _) => CONNTRACK_MODE_DISABLED,
                (true, true) => CONNTRACK_MODE_ON,
                (true, false) => CONNTRACK_MODE_OFF,
            };
        }
        entry
    }

    /// Parse a rule and check everything that does not need the store.
    fn prepare(&self, chain: ChainName, spec: &RuleSpec) -> Result<ChainRule, DomainError> {
        let rule = spec.to_rule()?;
        rule.validate_for(chain)?;
        if rule.conntrack.is_some() && !self.conntrack.is_active() {
            return Err(ChainError::ConntrackInactive.into());
        }
        if let Some(name) = rule.interface_for(chain) {
            self.interfaces.index_of(name)?;
        }
        Ok(rule)
    }

    /// Rebuild (or mark for rebuild) everything a change to `chain`
    /// affects.
    fn commit(&mut self, chain: ChainName) -> Result<(), DomainError> {
        let mut affected = vec![chain];
        if chain == ChainName::Forward && self.horus_enabled {
            let forward_has_rules = self.chains.len_of(ChainName::Forward) > 0;
            if forward_has_rules != self.input_saw_forward_rules {
                // The fast path must be gone before FORWARD rules go live.
                if forward_has_rules {
                    affected.insert(0, ChainName::Input);
                } else {
                    affected.push(ChainName::Input);
                }
            }
        }

        if !self.interactive {
            self.dirty.extend(affected.iter().copied());
            for c in affected {
                self.metrics
                    .set_rules_loaded(c.as_str(), self.chains.len_of(c) as u64);
            }
            return Ok(());
        }

        let mut queue = affected.into_iter();
        while let Some(c) = queue.next() {
            let result = if c == ChainName::Forward && self.horus_shadows_forward() {
                Err(self.forward_blocked())
            } else {
                self.rebuild(c)
            };
            if let Err(e) = result {
                // Whatever was not rebuilt waits for the next attempt.
                self.dirty.insert(c);
                self.dirty.extend(queue);
                return Err(e);
            }
            self.refresh_accept_established(c);
        }
        Ok(())
    }

    /// FORWARD has rules while an INPUT fast-path table is still loaded.
    fn horus_shadows_forward(&self) -> bool {
        self.chains.len_of(ChainName::Forward) > 0
            && self.swapper(ChainName::Input).horus().is_some()
    }

    fn forward_blocked(&self) -> DomainError {
        let reason = "INPUT fast path is still loaded".to_string();
        error!(
            chain = %ChainName::Forward,
            horus_rules = self.horus_rules(),
            "FORWARD rules stay pending until INPUT drops its fast path"
        );
        self.metrics
            .record_rebuild(ChainName::Forward.as_str(), "failure");
        DomainError::RebuildFailed {
            chain: ChainName::Forward,
            reason,
        }
    }

    fn rebuild(&mut self, chain: ChainName) -> Result<(), DomainError> {
        let started = Instant::now();
        let result = self.swap_in_new_generation(chain);
        self.metrics
            .observe_rebuild_duration(chain.as_str(), started.elapsed().as_secs_f64());
        self.update_metrics(chain);
        match result {
            Ok(()) => {
                self.metrics.record_rebuild(chain.as_str(), "success");
                self.dirty.remove(&chain);
                info!(
                    chain = %chain,
                    rules = self.chains.len_of(chain),
                    pipeline = %self.pipeline_summary(chain),
                    "pipeline rebuilt"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_rebuild(chain.as_str(), "failure");
                self.dirty.insert(chain);
                error!(
                    chain = %chain,
                    bank = self.swapper(chain).next_bank().value(),
                    error = %e,
                    "pipeline rebuild failed, previous pipeline still serving"
                );
                Err(DomainError::RebuildFailed {
                    chain,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn swap_in_new_generation(&mut self, chain: ChainName) -> Result<(), DomainError> {
        let idx = chain.index() as usize;
        let interfaces = Arc::clone(&self.interfaces);
        let resolve = |name: &str| interfaces.index_of(name).ok();

        let rules = self.chains.get(chain)?;
        let plan = self
            .builder
            .build(rules, self.swapper(chain).next_bank(), resolve)?;
        let forward_rules = self.chains.len_of(ChainName::Forward);
        let horus = if chain == ChainName::Input && self.horus_enabled {
            self.horus.compile(rules.rules(), forward_rules)
        } else {
            None
        };
        let rule_count = u32::try_from(plan.rule_count).unwrap_or(u32::MAX);
        let mut entry = self.entry_points();

        let loader = Arc::clone(&self.loader);
        let fixed = &self.fixed;
        let ledger = &self.ledger;
        self.swappers[idx].swap(
            plan,
            horus,
            loader.as_ref(),
            |new_entry, horus_slot| {
                entry.entries[idx] = new_entry;
                entry.rule_counts[idx] = rule_count;
                if chain == ChainName::Input {
                    entry.horus_slot = horus_slot;
                }
                wire(loader.as_ref(), &entry, chain.hook())
            },
            |old| {
                if let Err(e) = harvest(fixed, ledger, chain, old.pipeline, old.horus) {
                    warn!(chain = %chain, "failed to read counters of retired pipeline: {e}");
                }
            },
        )?;

        lock(&self.ledger).generation_activated(chain);
        if chain == ChainName::Input {
            self.input_saw_forward_rules = forward_rules > 0;
        }
        Ok(())
    }

    /// Re-evaluate the accept-established shortcut after a rebuild.
    /// Only the connection-tracking label program is reloaded.
    fn refresh_accept_established(&mut self, chain: ChainName) {
        let Ok(stored) = self.chains.get_mut(chain) else {
            return;
        };
        let Some(enabled) = AcceptEstablishedOptimizer::apply(stored) else {
            debug!(
                chain = %chain,
                enabled = stored.accept_established(),
                "accept-established shortcut unchanged, no label reload"
            );
            return;
        };
        let spec = self.entry_points().conntrack_label(chain.hook());
        match self.loader.reload(&spec) {
            Ok(()) => {
                info!(chain = %chain, enabled, "accept-established shortcut updated");
                self.metrics.set_accept_established(chain.as_str(), enabled);
            }
            Err(e) => {
                warn!(chain = %chain, "failed to reload conntrack label: {e}");
                if let Ok(stored) = self.chains.get_mut(chain) {
                    stored.set_accept_established(!enabled);
                }
            }
        }
    }

    fn harvest_active(&self, chain: ChainName) -> Result<(), DomainError> {
        let swapper = self.swapper(chain);
        let horus = if chain == ChainName::Input {
            swapper.horus()
        } else {
            None
        };
        harvest(&self.fixed, &self.ledger, chain, swapper.active(), horus)
    }

    fn update_metrics(&self, chain: ChainName) {
        let name = chain.as_str();
        self.metrics
            .set_rules_loaded(name, self.chains.len_of(chain) as u64);
        let stages = self
            .swapper(chain)
            .active()
            .map_or(0, |g| g.stages().len() as u64);
        self.metrics.set_pipeline_stages(name, stages);
        if chain == ChainName::Input {
            self.metrics.set_horus_rules(self.horus_rules() as u64);
        }
    }
}

impl IptablesService for IptablesAppService {
    fn append_rule(&mut self, chain: ChainName, rule: &RuleSpec) -> Result<usize, DomainError> {
        let rule = self.prepare(chain, rule)?;
        let id = self.chains.get_mut(chain)?.append(rule)?;
        lock(&self.ledger).rule_inserted(chain, id);
        debug!(chain = %chain, id, "rule appended");
        self.commit(chain)?;
        Ok(id)
    }

    fn insert_rule(
        &mut self,
        chain: ChainName,
        id: usize,
        rule: &RuleSpec,
    ) -> Result<usize, DomainError> {
        let rule = self.prepare(chain, rule)?;
        let id = self.chains.get_mut(chain)?.insert(id, rule)?;
        lock(&self.ledger).rule_inserted(chain, id);
        debug!(chain = %chain, id, "rule inserted");
        self.commit(chain)?;
        Ok(id)
    }

    fn delete_rule(&mut self, chain: ChainName, rule: &RuleSpec) -> Result<usize, DomainError> {
        let rule = rule.to_rule()?;
        let id = self.chains.get_mut(chain)?.delete_matching(&rule)?;
        lock(&self.ledger).rule_deleted(chain, id);
        debug!(chain = %chain, id, "rule deleted");
        self.commit(chain)?;
        Ok(id)
    }

    fn set_default_action(
        &mut self,
        chain: ChainName,
        action: RuleAction,
    ) -> Result<(), DomainError> {
        if !self.chains.get_mut(chain)?.set_default(action) {
            debug!(chain = %chain, %action, "default action unchanged");
            return Ok(());
        }
        info!(chain = %chain, %action, "default action changed");
        if !self.interactive {
            self.dirty.insert(chain);
            return Ok(());
        }

        let loader = Arc::clone(&self.loader);
        let result = self.swappers[chain.index() as usize]
            .reload_default(loader.as_ref(), action)
            .and_then(|()| wire(loader.as_ref(), &self.entry_points(), chain.hook()));
        if let Err(e) = result {
            warn!(chain = %chain, "failed to reload programs for new default action: {e}");
            self.dirty.insert(chain);
            return Err(e);
        }
        Ok(())
    }

    fn set_interactive(&mut self, interactive: bool) {
        if self.interactive != interactive {
            info!(interactive, "rule commit mode changed");
        }
        self.interactive = interactive;
    }

    fn apply_rules(&mut self) -> Result<(), DomainError> {
        let pending: Vec<ChainName> = ChainName::ALL
            .into_iter()
            .filter(|c| self.dirty.contains(c))
            .collect();
        if pending.is_empty() {
            debug!("no pending chain changes");
            return Ok(());
        }
        let mut first_err = None;
        for chain in &pending {
            let result = if *chain == ChainName::Forward && self.horus_shadows_forward() {
                Err(self.forward_blocked())
            } else {
                self.rebuild(*chain)
            };
            match result {
                Ok(()) => self.refresh_accept_established(*chain),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        info!(chains = pending.len(), failed = self.dirty.len(), "pending rules applied");
        first_err.map_or(Ok(()), Err)
    }

    fn reset_counters(&mut self, chain: ChainName) -> Result<(), DomainError> {
        self.chains.get(chain)?;
        self.harvest_active(chain)?;
        lock(&self.ledger).reset(chain);
        debug!(chain = %chain, "counters reset");
        Ok(())
    }

    fn rule_counters(&self, chain: ChainName, id: usize) -> Result<PacketCounters, DomainError> {
        let stored = self.chains.get(chain)?;
        if id >= stored.len() {
            return Err(DomainError::RuleNotFound(format!("{chain} rule {id}")));
        }
        self.harvest_active(chain)?;
        Ok(lock(&self.ledger).rule(chain, id))
    }

    fn default_action_counters(&self, chain: ChainName) -> Result<PacketCounters, DomainError> {
        self.chains.get(chain)?;
        self.harvest_active(chain)?;
        Ok(lock(&self.ledger).default_action(chain))
    }

    fn rule_count(&self, chain: ChainName) -> usize {
        self.chains.len_of(chain)
    }
}
