use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::chain::entity::PacketInfo;
use domain::common::entity::{ChainName, Hook, RuleAction};
use domain::common::error::DomainError;
use domain::compiler::field::MatchField;
use domain::horus::entity::HorusSignature;
use domain::pipeline::entity::{StageKind, Verdict};
use ebpf_common::pipeline::{
    CONNTRACK_MODE_ON, SLOT_CHAIN_FORWARDER, SLOT_CHAIN_SELECTOR, SLOT_CONNTRACK_LABEL,
    SLOT_PARSER, TABLE_ACCEPT_ESTABLISHED_BYTES, TABLE_ACCEPT_ESTABLISHED_PKTS, TABLE_ACTIONS,
    TABLE_BITVECTORS, TABLE_BYTES, TABLE_DEFAULT_BYTES, TABLE_DEFAULT_PKTS, TABLE_HORUS,
    TABLE_HORUS_BYTES, TABLE_HORUS_PKTS, TABLE_PKTS, TABLE_TIMESTAMP,
};
use ports::secondary::program_loader_port::{
    Program, ProgramHandle, ProgramLoaderPort, ProgramSpec, TableHandle, TableKey, TableKind,
    TableValue,
};

use super::table::MemoryTable;

/// One recorded loader call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderOp {
    Load(ProgramSpec),
    Reload(ProgramSpec),
    Unload { index: u16, hook: Hook },
}

/// Which path of the simulated datapath decided a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecidedBy {
    Horus,
    AllowAll,
    AcceptEstablished,
    Default,
    Rule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimVerdict {
    pub verdict: Verdict,
    pub decided_by: DecidedBy,
}

// ── Programs ────────────────────────────────────────────────────────

pub struct MemoryProgram {
    index: u16,
    hook: Hook,
    spec: Mutex<ProgramSpec>,
    tables: BTreeMap<&'static str, Arc<MemoryTable>>,
}

impl MemoryProgram {
    fn new(spec: &ProgramSpec) -> Self {
        Self {
            index: spec.index,
            hook: spec.hook,
            tables: tables_for(&spec.program),
            spec: Mutex::new(spec.clone()),
        }
    }

    pub fn spec(&self) -> ProgramSpec {
        lock(&self.spec).clone()
    }

    fn memory_table(&self, name: &str) -> Option<&Arc<MemoryTable>> {
        self.tables.get(name)
    }
}

impl ProgramHandle for MemoryProgram {
    fn index(&self) -> u16 {
        self.index
    }

    fn hook(&self) -> Hook {
        self.hook
    }

    fn table(&self, name: &str) -> Result<Arc<dyn TableHandle>, DomainError> {
        self.tables
            .get(name)
            .map(|t| Arc::clone(t) as Arc<dyn TableHandle>)
            .ok_or_else(|| {
                DomainError::EngineError(format!(
                    "program in slot {}@{} has no table {name}",
                    self.index, self.hook
                ))
            })
    }
}

fn tables_for(program: &Program) -> BTreeMap<&'static str, Arc<MemoryTable>> {
    let table = |kind| Arc::new(MemoryTable::new(kind));
    let mut tables = BTreeMap::new();
    match program {
        Program::ChainSelector { .. } => {
            tables.insert(TABLE_DEFAULT_PKTS, table(TableKind::PerCpuArray));
            tables.insert(TABLE_DEFAULT_BYTES, table(TableKind::PerCpuArray));
        }
        Program::ConntrackLabel { .. } => {
            tables.insert(TABLE_ACCEPT_ESTABLISHED_PKTS, table(TableKind::PerCpuArray));
            tables.insert(TABLE_ACCEPT_ESTABLISHED_BYTES, table(TableKind::PerCpuArray));
        }
        Program::ConntrackTableUpdate => {
            tables.insert(TABLE_TIMESTAMP, table(TableKind::PerCpuArray));
        }
        Program::Horus { .. } => {
            tables.insert(TABLE_HORUS, table(TableKind::ExactMatch));
            tables.insert(TABLE_HORUS_PKTS, table(TableKind::PerCpuArray));
            tables.insert(TABLE_HORUS_BYTES, table(TableKind::PerCpuArray));
        }
        Program::Stage { kind, .. } => match kind {
            StageKind::Field(MatchField::SrcIp | MatchField::DstIp) => {
                tables.insert(TABLE_BITVECTORS, table(TableKind::LongestPrefixMatch));
            }
            StageKind::Field(MatchField::Conntrack | MatchField::TcpFlags) => {
                tables.insert(TABLE_BITVECTORS, table(TableKind::Array));
            }
            StageKind::Field(_) => {
                tables.insert(TABLE_BITVECTORS, table(TableKind::ExactMatch));
            }
            StageKind::BitScan => {}
            StageKind::Action => {
                tables.insert(TABLE_ACTIONS, table(TableKind::Array));
                tables.insert(TABLE_PKTS, table(TableKind::PerCpuArray));
                tables.insert(TABLE_BYTES, table(TableKind::PerCpuArray));
            }
        },
        Program::Parser { .. } | Program::ChainForwarder { .. } => {}
    }
    tables
}

// ── Substrate ───────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    slots: BTreeMap<(Hook, u16), Arc<MemoryProgram>>,
    ops: Vec<LoaderOp>,
    fail_loads: BTreeSet<(Hook, u16)>,
    fail_reloads: BTreeSet<(Hook, u16)>,
}

/// Program loader that keeps programs and tables in process memory and
/// can push packets through them.
#[derive(Default)]
pub struct MemorySubstrate {
    inner: Mutex<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later load into this slot fail.
    pub fn fail_loads_at(&self, index: u16, hook: Hook) {
        lock(&self.inner).fail_loads.insert((hook, index));
    }

    /// Make every later reload of this slot fail.
    pub fn fail_reloads_at(&self, index: u16, hook: Hook) {
        lock(&self.inner).fail_reloads.insert((hook, index));
    }

    pub fn clear_failures(&self) {
        let mut inner = lock(&self.inner);
        inner.fail_loads.clear();
        inner.fail_reloads.clear();
    }

    pub fn ops(&self) -> Vec<LoaderOp> {
        lock(&self.inner).ops.clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.inner).ops.clear();
    }

    pub fn is_loaded(&self, index: u16, hook: Hook) -> bool {
        lock(&self.inner).slots.contains_key(&(hook, index))
    }

    pub fn loaded_count(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn program(&self, index: u16, hook: Hook) -> Option<Arc<MemoryProgram>> {
        lock(&self.inner).slots.get(&(hook, index)).cloned()
    }

    /// Run a packet bound to `chain` through the loaded programs, the
    /// way the kernel datapath would, updating counters on the way.
    pub fn process(&self, chain: ChainName, packet: &PacketInfo) -> Result<SimVerdict, DomainError> {
        let hook = chain.hook();
        let idx = chain.index() as usize;
        let missing = |what: &str| DomainError::EngineError(format!("{what} not loaded on {hook}"));

        let parser = self.program(SLOT_PARSER, hook).ok_or_else(|| missing("parser"))?;
        if let Program::Parser { horus_slot: Some(slot) } = parser.spec().program
            && chain == ChainName::Input
            && let Some(verdict) = self.run_horus(slot, packet)?
        {
            return Ok(verdict);
        }

        let selector = self
            .program(SLOT_CHAIN_SELECTOR, hook)
            .ok_or_else(|| missing("chain selector"))?;
        let Program::ChainSelector { defaults, rule_counts, allow_all } = selector.spec().program
        else {
            return Err(missing("chain selector"));
        };
        let default = defaults[idx];
        if allow_all && chain != ChainName::Output {
            return Ok(SimVerdict {
                verdict: Verdict::default_action(RuleAction::Accept),
                decided_by: DecidedBy::AllowAll,
            });
        }
        if rule_counts[idx] == 0 {
            return self.decide_default(&selector, idx, default, packet);
        }

        if let Some(label) = self.program(SLOT_CONNTRACK_LABEL, hook)
            && let Program::ConntrackLabel { modes } = label.spec().program
            && modes[idx] == CONNTRACK_MODE_ON
            && packet.conntrack == domain::common::entity::ConntrackStatus::Established
        {
            bump(&label, TABLE_ACCEPT_ESTABLISHED_PKTS, TABLE_ACCEPT_ESTABLISHED_BYTES, idx, packet);
            return Ok(SimVerdict {
                verdict: Verdict {
                    action: RuleAction::Accept,
                    rule: Some(0),
                },
                decided_by: DecidedBy::AcceptEstablished,
            });
        }

        let forwarder = self
            .program(SLOT_CHAIN_FORWARDER, hook)
            .ok_or_else(|| missing("chain forwarder"))?;
        let Program::ChainForwarder { entries, .. } = forwarder.spec().program else {
            return Err(missing("chain forwarder"));
        };
        let Some(mut current) = entries[idx] else {
            return self.decide_default(&selector, idx, default, packet);
        };

        let mut matched: Option<Vec<u64>> = None;
        let mut rule = None;
        loop {
            let stage = self
                .program(current, hook)
                .ok_or_else(|| missing(&format!("stage {current}")))?;
            let Program::Stage { kind, next, rule_count, default_action, .. } = stage.spec().program
            else {
                return Err(missing(&format!("stage {current}")));
            };
            match kind {
                StageKind::Field(field) => {
                    let Some(words) = lookup_field(&stage, field, chain, packet)? else {
                        return self.decide_default(&selector, idx, default_action, packet);
                    };
                    let acc = match matched.take() {
                        Some(mut acc) => {
                            acc.iter_mut().zip(&words).for_each(|(a, w)| *a &= *w);
                            acc
                        }
                        None => words,
                    };
                    if acc.iter().all(|w| *w == 0) {
                        return self.decide_default(&selector, idx, default_action, packet);
                    }
                    matched = Some(acc);
                }
                StageKind::BitScan => {
                    rule = first_rule(matched.as_deref(), rule_count as usize);
                    if rule.is_none() {
                        return self.decide_default(&selector, idx, default_action, packet);
                    }
                }
                StageKind::Action => {
                    let Some(id) = rule else {
                        return self.decide_default(&selector, idx, default_action, packet);
                    };
                    let key = TableKey::Index(u32::try_from(id).unwrap_or(u32::MAX));
                    let action = stage
                        .table(TABLE_ACTIONS)?
                        .get(&key)?
                        .and_then(|v| match v {
                            TableValue::Action(a) => Some(RuleAction::from_u8(a)),
                            _ => None,
                        })
                        .unwrap_or(default_action);
                    bump(&stage, TABLE_PKTS, TABLE_BYTES, id, packet);
                    return Ok(SimVerdict {
                        verdict: Verdict {
                            action,
                            rule: Some(id),
                        },
                        decided_by: DecidedBy::Rule,
                    });
                }
            }
            match next {
                Some(n) => current = n,
                None => return self.decide_default(&selector, idx, default_action, packet),
            }
        }
    }

    fn run_horus(&self, slot: u16, packet: &PacketInfo) -> Result<Option<SimVerdict>, DomainError> {
        let Some(horus) = self.program(slot, Hook::Ingress) else {
            return Ok(None);
        };
        let Program::Horus { signature } = horus.spec().program else {
            return Ok(None);
        };
        let key = HorusSignature(signature).packet_key(packet);
        let Some(TableValue::Horus(value)) = horus.table(TABLE_HORUS)?.get(&TableKey::Horus(key))?
        else {
            return Ok(None);
        };
        let id = value.rule_id as usize;
        bump(&horus, TABLE_HORUS_PKTS, TABLE_HORUS_BYTES, id, packet);
        Ok(Some(SimVerdict {
            verdict: Verdict {
                action: RuleAction::from_u8(value.action),
                rule: Some(id),
            },
            decided_by: DecidedBy::Horus,
        }))
    }

    fn decide_default(
        &self,
        selector: &MemoryProgram,
        idx: usize,
        action: RuleAction,
        packet: &PacketInfo,
    ) -> Result<SimVerdict, DomainError> {
        bump(selector, TABLE_DEFAULT_PKTS, TABLE_DEFAULT_BYTES, idx, packet);
        Ok(SimVerdict {
            verdict: Verdict::default_action(action),
            decided_by: DecidedBy::Default,
        })
    }
}

fn lookup_field(
    stage: &MemoryProgram,
    field: MatchField,
    chain: ChainName,
    packet: &PacketInfo,
) -> Result<Option<Vec<u64>>, DomainError> {
    let Some(table) = stage.memory_table(TABLE_BITVECTORS) else {
        return Ok(None);
    };
    let exact_or_wildcard = |key: TableKey, wildcard: TableKey| -> Result<Option<TableValue>, DomainError> {
        Ok(match table.get(&key)? {
            Some(v) => Some(v),
            None => table.get(&wildcard)?,
        })
    };
    let value = match field {
        MatchField::Conntrack => table.get(&TableKey::Index(u32::from(packet.conntrack.to_u8())))?,
        MatchField::TcpFlags => table.get(&TableKey::Index(u32::from(packet.tcp_flags)))?,
        MatchField::SrcIp => table.longest_prefix(packet.src_ip),
        MatchField::DstIp => table.longest_prefix(packet.dst_ip),
        MatchField::L4Proto => exact_or_wildcard(TableKey::Proto(packet.l4proto), TableKey::Proto(0))?,
        MatchField::SrcPort => exact_or_wildcard(TableKey::Port(packet.src_port), TableKey::Port(0))?,
        MatchField::DstPort => exact_or_wildcard(TableKey::Port(packet.dst_port), TableKey::Port(0))?,
        MatchField::Interface => exact_or_wildcard(
            TableKey::Ifindex(packet.interface_for(chain)),
            TableKey::Ifindex(0),
        )?,
    };
    Ok(match value {
        Some(TableValue::Bitvector(words)) => Some(words),
        _ => None,
    })
}

fn first_rule(words: Option<&[u64]>, rule_count: usize) -> Option<usize> {
    let per_word = ebpf_common::pipeline::RULES_PER_WORD as usize;
    match words {
        // No field stage: every rule matches.
        None => (rule_count > 0).then_some(0),
        Some(words) => words.iter().enumerate().find_map(|(i, w)| {
            (*w != 0).then(|| i * per_word + w.trailing_zeros() as usize)
        }),
    }
    .filter(|id| *id < rule_count)
}

fn bump(program: &MemoryProgram, pkts: &str, bytes: &str, id: usize, packet: &PacketInfo) {
    let key = TableKey::Index(u32::try_from(id).unwrap_or(u32::MAX));
    if let Some(t) = program.memory_table(pkts) {
        t.add(key, 1);
    }
    if let Some(t) = program.memory_table(bytes) {
        t.add(key, u64::from(packet.len));
    }
}

impl ProgramLoaderPort for MemorySubstrate {
    fn load(&self, spec: &ProgramSpec) -> Result<Arc<dyn ProgramHandle>, DomainError> {
        let mut inner = lock(&self.inner);
        inner.ops.push(LoaderOp::Load(spec.clone()));
        if inner.fail_loads.contains(&(spec.hook, spec.index)) {
            return Err(DomainError::EngineError(format!("injected load failure for {spec}")));
        }
        let program = Arc::new(MemoryProgram::new(spec));
        inner.slots.insert((spec.hook, spec.index), Arc::clone(&program));
        Ok(program)
    }

    fn reload(&self, spec: &ProgramSpec) -> Result<(), DomainError> {
        let mut inner = lock(&self.inner);
        inner.ops.push(LoaderOp::Reload(spec.clone()));
        if inner.fail_reloads.contains(&(spec.hook, spec.index)) {
            return Err(DomainError::EngineError(format!("injected reload failure for {spec}")));
        }
        let program = inner.slots.get(&(spec.hook, spec.index)).ok_or_else(|| {
            DomainError::EngineError(format!("cannot reload {spec}: slot is empty"))
        })?;
        *lock(&program.spec) = spec.clone();
        Ok(())
    }

    fn unload(&self, index: u16, hook: Hook) -> Result<(), DomainError> {
        let mut inner = lock(&self.inner);
        inner.ops.push(LoaderOp::Unload { index, hook });
        inner.slots.remove(&(hook, index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::chain::entity::IpNetwork;

    fn stage_spec(index: u16, kind: StageKind, next: Option<u16>) -> ProgramSpec {
        ProgramSpec {
            index,
            hook: Hook::Ingress,
            program: Program::Stage {
                chain: ChainName::Input,
                kind,
                next,
                default_action: RuleAction::Drop,
                rule_count: 2,
            },
        }
    }

    #[test]
    fn load_records_ops_and_creates_tables() {
        let substrate = MemorySubstrate::new();
        let handle = substrate
            .load(&stage_spec(16, StageKind::Action, None))
            .unwrap();
        assert!(handle.table(TABLE_ACTIONS).is_ok());
        assert!(handle.table(TABLE_BITVECTORS).is_err());
        assert!(substrate.is_loaded(16, Hook::Ingress));
        substrate.unload(16, Hook::Ingress).unwrap();
        assert_eq!(substrate.ops().len(), 2);
        assert_eq!(substrate.loaded_count(), 0);
    }

    #[test]
    fn injected_failures() {
        let substrate = MemorySubstrate::new();
        substrate.fail_loads_at(16, Hook::Ingress);
        assert!(substrate.load(&stage_spec(16, StageKind::Action, None)).is_err());
        assert!(!substrate.is_loaded(16, Hook::Ingress));
        assert!(substrate.reload(&stage_spec(15, StageKind::BitScan, Some(16))).is_err());
    }

    #[test]
    fn ip_stage_tables_are_prefix_matched() {
        let substrate = MemorySubstrate::new();
        let handle = substrate
            .load(&stage_spec(8, StageKind::Field(MatchField::SrcIp), Some(15)))
            .unwrap();
        let table = handle.table(TABLE_BITVECTORS).unwrap();
        assert_eq!(table.kind(), TableKind::LongestPrefixMatch);
        table
            .set(
                TableKey::Prefix("10.0.0.0/8".parse::<IpNetwork>().unwrap()),
                TableValue::Bitvector(vec![0b1]),
            )
            .unwrap();
        let program = substrate.program(8, Hook::Ingress).unwrap();
        let hit = lookup_field(
            &program,
            MatchField::SrcIp,
            ChainName::Input,
            &PacketInfo {
                src_ip: u32::from(std::net::Ipv4Addr::new(10, 1, 2, 3)),
                ..PacketInfo::default()
            },
        )
        .unwrap();
        assert_eq!(hit, Some(vec![0b1]));
    }

    #[test]
    fn first_rule_respects_count() {
        assert_eq!(first_rule(Some(&[0b100]), 3), Some(2));
        assert_eq!(first_rule(Some(&[0b100]), 2), None);
        assert_eq!(first_rule(Some(&[0, 1]), 100), Some(63));
        assert_eq!(first_rule(None, 1), Some(0));
        assert_eq!(first_rule(None, 0), None);
    }
}
