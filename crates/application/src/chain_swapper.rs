use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::common::entity::{ChainName, Hook, RuleAction};
use domain::common::error::DomainError;
use domain::compiler::field::FieldTable;
use domain::horus::entity::HorusTable;
use domain::pipeline::entity::{
    Bank, PacketCounters, PipelinePlan, PlannedStage, StageKind, StageTable,
};
use ebpf_common::pipeline::{
    SLOT_HORUS, SLOT_HORUS_SWAP, TABLE_ACTIONS, TABLE_BITVECTORS, TABLE_BYTES, TABLE_HORUS,
    TABLE_HORUS_BYTES, TABLE_HORUS_PKTS, TABLE_PKTS,
};
use ports::secondary::program_loader_port::{
    Program, ProgramHandle, ProgramLoaderPort, ProgramSpec, TableHandle, TableKey, TableValue,
};
use tracing::{debug, warn};

/// Progress of a chain's stage replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Idle,
    Building,
    Wired,
    Active,
    Draining,
}

// ── Loaded stages ───────────────────────────────────────────────────

/// A stage placed in the substrate. Table writes and counter reads go
/// through `lock`.
pub struct LoadedStage {
    index: u16,
    kind: StageKind,
    handle: Arc<dyn ProgramHandle>,
    lock: Mutex<()>,
}

impl LoadedStage {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn table(&self, name: &str) -> Result<Arc<dyn TableHandle>, DomainError> {
        self.handle.table(name)
    }

    pub fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read and zero the per-rule counters of an action stage.
    pub fn drain_counters(&self, rules: usize) -> Result<Vec<PacketCounters>, DomainError> {
        let _guard = self.guard();
        drain_pair(&*self.table(TABLE_PKTS)?, &*self.table(TABLE_BYTES)?, rules)
    }
}

/// Index-addressed arena of the stages one rebuild produced. `next`
/// references in the plan are slot indices into this arena.
pub struct PipelineGeneration {
    plan: PipelinePlan,
    stages: Vec<LoadedStage>,
}

impl PipelineGeneration {
    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn entry(&self) -> Option<u16> {
        self.plan.entry()
    }

    pub fn stages(&self) -> &[LoadedStage] {
        &self.stages
    }

    pub fn stage(&self, index: u16) -> Option<&LoadedStage> {
        self.stages.iter().find(|s| s.index == index)
    }

    pub fn action_stage(&self) -> Option<&LoadedStage> {
        self.stages.iter().find(|s| s.kind == StageKind::Action)
    }
}

// ── Horus double buffer ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorusSlot {
    Primary,
    Swap,
}

impl HorusSlot {
    pub fn index(self) -> u16 {
        match self {
            Self::Primary => SLOT_HORUS,
            Self::Swap => SLOT_HORUS_SWAP,
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Swap,
            Self::Swap => Self::Primary,
        }
    }
}

/// The Horus program occupying one of the two fast-path slots.
pub struct HorusGeneration {
    slot: HorusSlot,
    table: HorusTable,
    handle: Arc<dyn ProgramHandle>,
    lock: Mutex<()>,
}

impl HorusGeneration {
    pub fn slot(&self) -> HorusSlot {
        self.slot
    }

    pub fn table(&self) -> &HorusTable {
        &self.table
    }

    /// Read and zero the per-rule fast-path counters.
    pub fn drain_counters(&self) -> Result<Vec<PacketCounters>, DomainError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        drain_pair(
            &*self.handle.table(TABLE_HORUS_PKTS)?,
            &*self.handle.table(TABLE_HORUS_BYTES)?,
            self.table.covered_rules,
        )
    }
}

fn drain_pair(
    pkts: &dyn TableHandle,
    bytes: &dyn TableHandle,
    rules: usize,
) -> Result<Vec<PacketCounters>, DomainError> {
    let mut out = vec![PacketCounters::default(); rules];
    for (key, value) in pkts.get_all()? {
        if let TableKey::Index(id) = key
            && let Some(slot) = out.get_mut(id as usize)
        {
            slot.packets = value.as_counter();
        }
    }
    for (key, value) in bytes.get_all()? {
        if let TableKey::Index(id) = key
            && let Some(slot) = out.get_mut(id as usize)
        {
            slot.bytes = value.as_counter();
        }
    }
    for (id, counters) in out.iter().enumerate() {
        if *counters != PacketCounters::default() {
            let key = TableKey::Index(u32::try_from(id).unwrap_or(u32::MAX));
            pkts.set(key, TableValue::Counter(0))?;
            bytes.set(key, TableValue::Counter(0))?;
        }
    }
    Ok(out)
}

/// Read and zero one entry of a packet/byte counter pair.
pub(crate) fn drain_entry(
    pkts: &dyn TableHandle,
    bytes: &dyn TableHandle,
    index: u32,
) -> Result<PacketCounters, DomainError> {
    let key = TableKey::Index(index);
    let counters = PacketCounters {
        packets: pkts.get(&key)?.map_or(0, |v| v.as_counter()),
        bytes: bytes.get(&key)?.map_or(0, |v| v.as_counter()),
    };
    if counters != PacketCounters::default() {
        pkts.set(key, TableValue::Counter(0))?;
        bytes.set(key, TableValue::Counter(0))?;
    }
    Ok(counters)
}

/// What the retire hook sees of the generation being torn down.
pub struct Retiring<'a> {
    pub pipeline: Option<&'a PipelineGeneration>,
    pub horus: Option<&'a HorusGeneration>,
}

// ── Swapper ─────────────────────────────────────────────────────────

/// Owns a chain's active pipeline generation and replaces it as a
/// whole: `Idle → Building → Wired → Active → Draining → Idle`.
pub struct ChainSwapper {
    chain: ChainName,
    state: SwapState,
    next_bank: Bank,
    active: Option<PipelineGeneration>,
    horus: Option<HorusGeneration>,
}

impl ChainSwapper {
    pub fn new(chain: ChainName) -> Self {
        Self {
            chain,
            state: SwapState::Idle,
            next_bank: Bank::default(),
            active: None,
            horus: None,
        }
    }

    pub fn chain(&self) -> ChainName {
        self.chain
    }

    pub fn state(&self) -> SwapState {
        self.state
    }

    /// Bank the next rebuild is laid out in.
    pub fn next_bank(&self) -> Bank {
        self.next_bank
    }

    pub fn active(&self) -> Option<&PipelineGeneration> {
        self.active.as_ref()
    }

    pub fn horus(&self) -> Option<&HorusGeneration> {
        self.horus.as_ref()
    }

    pub fn entry(&self) -> Option<u16> {
        self.active.as_ref().and_then(PipelineGeneration::entry)
    }

    /// Replace the active generation with `plan` (and the Horus table,
    /// INPUT only).
    ///
    /// `wire` repoints the entry programs at the new generation; it gets
    /// the new entry slot and the new Horus slot. `retire` runs after
    /// wiring, before the previous generation is unloaded. A load or
    /// wiring failure unloads whatever was built and leaves the previous
    /// generation serving.
    pub fn swap<W, R>(
        &mut self,
        plan: PipelinePlan,
        horus: Option<HorusTable>,
        loader: &dyn ProgramLoaderPort,
        wire: W,
        retire: R,
    ) -> Result<(), DomainError>
    where
        W: FnOnce(Option<u16>, Option<u16>) -> Result<(), DomainError>,
        R: FnOnce(Retiring<'_>),
    {
        let hook = self.chain.hook();

        self.state = SwapState::Building;
        let new_horus = match horus {
            Some(table) => {
                let slot = self.horus.as_ref().map_or(HorusSlot::Primary, |h| h.slot.other());
                match load_horus(loader, slot, table) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        self.state = SwapState::Idle;
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        let generation = match load_generation(loader, hook, plan) {
            Ok(g) => g,
            Err(e) => {
                if let Some(ref h) = new_horus {
                    unload_quietly(loader, h.slot.index(), Hook::Ingress);
                }
                self.state = SwapState::Idle;
                return Err(e);
            }
        };

        if let Err(e) = wire(generation.entry(), new_horus.as_ref().map(|h| h.slot.index())) {
            unload_generation(loader, hook, &generation);
            if let Some(ref h) = new_horus {
                unload_quietly(loader, h.slot.index(), Hook::Ingress);
            }
            self.state = SwapState::Idle;
            return Err(e);
        }
        self.state = SwapState::Wired;

        let old = self.active.replace(generation);
        let old_horus = std::mem::replace(&mut self.horus, new_horus);
        self.state = SwapState::Active;

        self.state = SwapState::Draining;
        retire(Retiring {
            pipeline: old.as_ref(),
            horus: old_horus.as_ref(),
        });
        if let Some(ref old) = old {
            unload_generation(loader, hook, old);
        }
        if let Some(ref h) = old_horus {
            unload_quietly(loader, h.slot.index(), Hook::Ingress);
        }

        self.next_bank = self.next_bank.flip();
        self.state = SwapState::Idle;
        Ok(())
    }

    /// Reload every stage with a new default action. Tables are kept.
    pub fn reload_default(
        &mut self,
        loader: &dyn ProgramLoaderPort,
        default_action: RuleAction,
    ) -> Result<(), DomainError> {
        let Some(generation) = self.active.as_mut() else {
            return Ok(());
        };
        generation.plan.default_action = default_action;
        let hook = self.chain.hook();
        for planned in &generation.plan.stages {
            loader.reload(&stage_spec(&generation.plan, hook, planned))?;
        }
        Ok(())
    }

    /// Unload everything this chain owns.
    pub fn teardown(&mut self, loader: &dyn ProgramLoaderPort) {
        if let Some(generation) = self.active.take() {
            unload_generation(loader, self.chain.hook(), &generation);
        }
        if let Some(h) = self.horus.take() {
            unload_quietly(loader, h.slot.index(), Hook::Ingress);
        }
        self.state = SwapState::Idle;
    }
}

// ── Building ────────────────────────────────────────────────────────

fn stage_spec(plan: &PipelinePlan, hook: Hook, stage: &PlannedStage) -> ProgramSpec {
    ProgramSpec {
        index: stage.index,
        hook,
        program: Program::Stage {
            chain: plan.chain,
            kind: stage.kind(),
            next: stage.next,
            default_action: plan.default_action,
            rule_count: u32::try_from(plan.rule_count).unwrap_or(u32::MAX),
        },
    }
}

fn load_generation(
    loader: &dyn ProgramLoaderPort,
    hook: Hook,
    plan: PipelinePlan,
) -> Result<PipelineGeneration, DomainError> {
    let mut stages = Vec::with_capacity(plan.stages.len());
    for planned in &plan.stages {
        let spec = stage_spec(&plan, hook, planned);
        let loaded = loader.load(&spec).and_then(|handle| {
            let stage = LoadedStage {
                index: planned.index,
                kind: planned.kind(),
                handle,
                lock: Mutex::new(()),
            };
            {
                let _guard = stage.guard();
                populate(&stage, &planned.table)?;
            }
            Ok(stage)
        });
        match loaded {
            Ok(stage) => {
                debug!(stage = %spec, "stage loaded");
                stages.push(stage);
            }
            Err(e) => {
                for stage in &stages {
                    unload_quietly(loader, stage.index, hook);
                }
                unload_quietly(loader, planned.index, hook);
                return Err(e);
            }
        }
    }
    Ok(PipelineGeneration { plan, stages })
}

fn populate(stage: &LoadedStage, table: &StageTable) -> Result<(), DomainError> {
    match table {
        StageTable::BitScan => Ok(()),
        StageTable::Action(actions) => {
            let handle = stage.table(TABLE_ACTIONS)?;
            for (id, action) in actions.iter().enumerate() {
                let id = u32::try_from(id)
                    .map_err(|_| DomainError::ResourceExhausted("rule id overflow".to_string()))?;
                handle.set(TableKey::Index(id), TableValue::Action(action.to_u8()))?;
            }
            Ok(())
        }
        StageTable::Field(compiled) => {
            let handle = stage.table(TABLE_BITVECTORS)?;
            let value = |bv: &domain::compiler::bitvector::BitVector| {
                TableValue::Bitvector(bv.words().to_vec())
            };
            match &compiled.table {
                FieldTable::Conntrack(entries) | FieldTable::TcpFlags(entries) => {
                    for (i, bv) in entries.iter().enumerate() {
                        let key = TableKey::Index(u32::try_from(i).unwrap_or(u32::MAX));
                        handle.set(key, value(bv))?;
                    }
                }
                FieldTable::Ip(map) => {
                    for (net, bv) in map {
                        handle.set(TableKey::Prefix(*net), value(bv))?;
                    }
                }
                FieldTable::L4Proto(map) => {
                    for (proto, bv) in map {
                        handle.set(TableKey::Proto(*proto), value(bv))?;
                    }
                }
                FieldTable::Port(map) => {
                    for (port, bv) in map {
                        handle.set(TableKey::Port(*port), value(bv))?;
                    }
                }
                FieldTable::Interface(map) => {
                    for (ifindex, bv) in map {
                        handle.set(TableKey::Ifindex(*ifindex), value(bv))?;
                    }
                }
            }
            Ok(())
        }
    }
}

fn load_horus(
    loader: &dyn ProgramLoaderPort,
    slot: HorusSlot,
    table: HorusTable,
) -> Result<HorusGeneration, DomainError> {
    let spec = ProgramSpec {
        index: slot.index(),
        hook: Hook::Ingress,
        program: Program::Horus {
            signature: table.signature.0,
        },
    };
    let handle = loader.load(&spec)?;
    let filled = handle.table(TABLE_HORUS).and_then(|t| {
        for (key, value) in &table.entries {
            t.set(TableKey::Horus(*key), TableValue::Horus(*value))?;
        }
        Ok(())
    });
    if let Err(e) = filled {
        unload_quietly(loader, slot.index(), Hook::Ingress);
        return Err(e);
    }
    debug!(slot = slot.index(), entries = table.len(), "horus table loaded");
    Ok(HorusGeneration {
        slot,
        table,
        handle,
        lock: Mutex::new(()),
    })
}

// ── Teardown ────────────────────────────────────────────────────────

fn unload_generation(loader: &dyn ProgramLoaderPort, hook: Hook, generation: &PipelineGeneration) {
    for stage in &generation.stages {
        unload_quietly(loader, stage.index, hook);
    }
}

fn unload_quietly(loader: &dyn ProgramLoaderPort, index: u16, hook: Hook) {
    if let Err(e) = loader.unload(index, hook) {
        warn!(index, %hook, "failed to unload program: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::memory::substrate::MemorySubstrate;
    use domain::chain::entity::ChainRule;
    use domain::chain::store::Chain;
    use domain::horus::compiler::HorusCompiler;
    use domain::pipeline::builder::PipelineBuilder;

    fn no_ifaces(_: &str) -> Option<u32> {
        None
    }

    fn plan_for(chain: &Chain, bank: Bank) -> PipelinePlan {
        PipelineBuilder::new(64).build(chain, bank, no_ifaces).unwrap()
    }

    fn input_chain() -> Chain {
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 64);
        chain
            .append(ChainRule {
                dport: Some(22),
                action: RuleAction::Accept,
                ..ChainRule::default()
            })
            .unwrap();
        chain.append(ChainRule::default()).unwrap();
        chain
    }

    #[test]
    fn swap_alternates_banks_and_drains_old_stages() {
        let substrate = MemorySubstrate::new();
        let chain = input_chain();
        let mut swapper = ChainSwapper::new(ChainName::Input);

        let plan = plan_for(&chain, swapper.next_bank());
        swapper
            .swap(plan, None, &substrate, |_, _| Ok(()), |_| {})
            .unwrap();
        assert_eq!(swapper.entry(), Some(12));
        assert!(substrate.is_loaded(12, Hook::Ingress));
        assert_eq!(swapper.state(), SwapState::Idle);

        let plan = plan_for(&chain, swapper.next_bank());
        swapper
            .swap(plan, None, &substrate, |_, _| Ok(()), |_| {})
            .unwrap();
        assert_eq!(swapper.entry(), Some(22));
        assert!(!substrate.is_loaded(12, Hook::Ingress));
        assert!(substrate.is_loaded(22, Hook::Ingress));
    }

    #[test]
    fn failed_load_keeps_previous_generation() {
        let substrate = MemorySubstrate::new();
        let chain = input_chain();
        let mut swapper = ChainSwapper::new(ChainName::Input);
        swapper
            .swap(
                plan_for(&chain, swapper.next_bank()),
                None,
                &substrate,
                |_, _| Ok(()),
                |_| {},
            )
            .unwrap();

        substrate.fail_loads_at(25, Hook::Ingress);
        let mut wired = false;
        let err = swapper
            .swap(
                plan_for(&chain, swapper.next_bank()),
                None,
                &substrate,
                |_, _| {
                    wired = true;
                    Ok(())
                },
                |_| {},
            )
            .unwrap_err();
        assert!(err.to_string().contains("injected"));
        assert!(!wired);
        assert_eq!(swapper.entry(), Some(12));
        assert!(substrate.is_loaded(12, Hook::Ingress));
        assert!(!substrate.is_loaded(22, Hook::Ingress));
        assert_eq!(swapper.next_bank().value(), 1);
        assert_eq!(swapper.state(), SwapState::Idle);
    }

    #[test]
    fn wiring_happens_before_retire() {
        let substrate = MemorySubstrate::new();
        let chain = input_chain();
        let mut swapper = ChainSwapper::new(ChainName::Input);
        let order = std::cell::RefCell::new(Vec::new());
        for _ in 0..2 {
            swapper
                .swap(
                    plan_for(&chain, swapper.next_bank()),
                    None,
                    &substrate,
                    |entry, _| {
                        order.borrow_mut().push(format!("wire {entry:?}"));
                        Ok(())
                    },
                    |old| {
                        let entry = old.pipeline.and_then(PipelineGeneration::entry);
                        order.borrow_mut().push(format!("retire {entry:?}"));
                    },
                )
                .unwrap();
        }
        assert_eq!(
            order.into_inner(),
            vec![
                "wire Some(12)",
                "retire None",
                "wire Some(22)",
                "retire Some(12)"
            ]
        );
    }

    #[test]
    fn horus_alternates_slots() {
        let substrate = MemorySubstrate::new();
        let mut chain = Chain::new(ChainName::Input, RuleAction::Accept, 64);
        chain
            .append(ChainRule {
                src: Some("10.0.0.1".parse().unwrap()),
                ..ChainRule::default()
            })
            .unwrap();
        let mut swapper = ChainSwapper::new(ChainName::Input);
        let mut slots = Vec::new();
        for _ in 0..3 {
            let horus = HorusCompiler::new().compile(chain.rules(), 0);
            swapper
                .swap(
                    plan_for(&chain, swapper.next_bank()),
                    horus,
                    &substrate,
                    |_, slot| {
                        slots.push(slot);
                        Ok(())
                    },
                    |_| {},
                )
                .unwrap();
        }
        assert_eq!(
            slots,
            vec![Some(SLOT_HORUS), Some(SLOT_HORUS_SWAP), Some(SLOT_HORUS)]
        );
        assert!(substrate.is_loaded(SLOT_HORUS, Hook::Ingress));
        assert!(!substrate.is_loaded(SLOT_HORUS_SWAP, Hook::Ingress));

        swapper
            .swap(
                plan_for(&chain, swapper.next_bank()),
                None,
                &substrate,
                |_, _| Ok(()),
                |_| {},
            )
            .unwrap();
        assert!(swapper.horus().is_none());
        assert!(!substrate.is_loaded(SLOT_HORUS, Hook::Ingress));
    }

    #[test]
    fn teardown_unloads_everything() {
        let substrate = MemorySubstrate::new();
        let chain = input_chain();
        let mut swapper = ChainSwapper::new(ChainName::Input);
        swapper
            .swap(
                plan_for(&chain, swapper.next_bank()),
                None,
                &substrate,
                |_, _| Ok(()),
                |_| {},
            )
            .unwrap();
        swapper.teardown(&substrate);
        assert!(swapper.active().is_none());
        assert_eq!(substrate.loaded_count(), 0);
    }
}
