use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aya::maps::{Array, MapData, ProgramArray};
use aya::programs::{ProgramFd, SchedClassifier, TcAttachType, Xdp, XdpFlags, tc};
use aya::{Ebpf, EbpfLoader};
use domain::common::entity::{ChainName, Hook};
use domain::common::error::DomainError;
use domain::compiler::field::MatchField;
use domain::pipeline::entity::StageKind;
use ebpf_common::pipeline::{
    NO_NEXT_HOP, SLOT_FLAG_ALLOW_ALL, SLOT_PARSER, SlotConfig, TABLE_ACCEPT_ESTABLISHED_BYTES,
    TABLE_ACCEPT_ESTABLISHED_PKTS, TABLE_ACTIONS, TABLE_BITVECTORS, TABLE_BYTES,
    TABLE_DEFAULT_BYTES, TABLE_DEFAULT_PKTS, TABLE_HORUS, TABLE_HORUS_BYTES, TABLE_HORUS_PKTS,
    TABLE_PKTS, TABLE_TIMESTAMP, slot_flag_chain_empty,
};
use ports::secondary::program_loader_port::{
    Program, ProgramHandle, ProgramLoaderPort, ProgramSpec, TableHandle,
};
use tracing::{debug, info, warn};

use super::table::{EbpfTable, TableLayout};

/// Per-slot configuration map present in every object.
const SLOT_CONFIG_MAP: &str = "SLOT_CONFIG";

fn engine(context: impl std::fmt::Display, e: impl std::fmt::Display) -> DomainError {
    DomainError::EngineError(format!("{context}: {e}"))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Naming ──────────────────────────────────────────────────────────

/// Object file (without extension) implementing a program kind.
pub fn object_name(program: &Program) -> String {
    match program {
        Program::Stage { kind, .. } => match kind {
            StageKind::Field(field) => format!("stage_{}", field.as_str()),
            StageKind::BitScan => "stage_bitscan".to_string(),
            StageKind::Action => "stage_action".to_string(),
        },
        other => other.name().to_string(),
    }
}

/// Program array shared by every object attached to `hook`.
pub fn slots_map_name(hook: Hook) -> &'static str {
    match hook {
        Hook::Ingress => "INGRESS_SLOTS",
        Hook::Egress => "EGRESS_SLOTS",
    }
}

/// Tables each program kind exposes, with their kernel layout.
pub fn table_layout(program: &Program) -> Vec<(&'static str, TableLayout)> {
    match program {
        Program::ChainSelector { .. } => vec![
            (TABLE_DEFAULT_PKTS, TableLayout::Counters),
            (TABLE_DEFAULT_BYTES, TableLayout::Counters),
        ],
        Program::ConntrackLabel { .. } => vec![
            (TABLE_ACCEPT_ESTABLISHED_PKTS, TableLayout::Counters),
            (TABLE_ACCEPT_ESTABLISHED_BYTES, TableLayout::Counters),
        ],
        Program::ConntrackTableUpdate => vec![(TABLE_TIMESTAMP, TableLayout::Counters)],
        Program::Horus { .. } => vec![
            (TABLE_HORUS, TableLayout::Horus),
            (TABLE_HORUS_PKTS, TableLayout::Counters),
            (TABLE_HORUS_BYTES, TableLayout::Counters),
        ],
        Program::Stage { kind, .. } => match kind {
            StageKind::Field(field) => {
                let layout = match field {
                    MatchField::SrcIp | MatchField::DstIp => TableLayout::IpBits,
                    MatchField::SrcPort | MatchField::DstPort => TableLayout::PortBits,
                    MatchField::L4Proto => TableLayout::ProtoBits,
                    MatchField::Interface => TableLayout::IfindexBits,
                    MatchField::Conntrack | MatchField::TcpFlags => TableLayout::DenseBits,
                };
                vec![(TABLE_BITVECTORS, layout)]
            }
            StageKind::BitScan => Vec::new(),
            StageKind::Action => vec![
                (TABLE_ACTIONS, TableLayout::Actions),
                (TABLE_PKTS, TableLayout::Counters),
                (TABLE_BYTES, TableLayout::Counters),
            ],
        },
        Program::Parser { .. } | Program::ChainForwarder { .. } => Vec::new(),
    }
}

/// Encode a program's parameters into its slot configuration.
pub fn slot_config(program: &Program) -> SlotConfig {
    let mut config = SlotConfig {
        next_hop: [NO_NEXT_HOP; 3],
        rule_count: 0,
        default_action: [0; 3],
        conntrack_mode: [0; 3],
        flags: 0,
    };
    match program {
        Program::Parser { horus_slot } => {
            config.next_hop[0] = horus_slot.unwrap_or(NO_NEXT_HOP);
        }
        Program::ChainSelector {
            defaults,
            rule_counts,
            allow_all,
        } => {
            config.default_action = defaults.map(|a| a.to_u8());
            if *allow_all {
                config.flags |= SLOT_FLAG_ALLOW_ALL;
            }
            for chain in ChainName::ALL {
                if rule_counts[chain.index() as usize] == 0 {
                    config.flags |= slot_flag_chain_empty(chain.index());
                }
            }
        }
        Program::ConntrackLabel { modes } => config.conntrack_mode = *modes,
        Program::ChainForwarder { entries, defaults } => {
            config.next_hop = entries.map(|e| e.unwrap_or(NO_NEXT_HOP));
            config.default_action = defaults.map(|a| a.to_u8());
        }
        Program::ConntrackTableUpdate => {}
        Program::Horus { signature } => config.rule_count = u16::from(*signature),
        Program::Stage {
            chain,
            next,
            default_action,
            rule_count,
            ..
        } => {
            config.next_hop[0] = next.unwrap_or(NO_NEXT_HOP);
            config.rule_count = u16::try_from(*rule_count).unwrap_or(u16::MAX);
            config.default_action[chain.index() as usize] = default_action.to_u8();
        }
    }
    config
}

// ── Loaded program ──────────────────────────────────────────────────

/// One object instance placed in a slot. Dropping it detaches and
/// unloads the program.
pub struct EbpfProgram {
    index: u16,
    hook: Hook,
    config: Mutex<Array<MapData, SlotConfig>>,
    tables: BTreeMap<&'static str, Arc<EbpfTable>>,
    _ebpf: Mutex<Ebpf>,
}

impl EbpfProgram {
    fn write_config(&self, program: &Program) -> Result<(), DomainError> {
        lock(&self.config)
            .set(0, slot_config(program), 0)
            .map_err(|e| engine(format!("write config of slot {}@{}", self.index, self.hook), e))
    }
}

impl ProgramHandle for EbpfProgram {
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

// ── Substrate ───────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Arc<Vec<u8>>>,
    slot_arrays: BTreeMap<Hook, ProgramArray<MapData>>,
    slots: BTreeMap<(Hook, u16), Arc<EbpfProgram>>,
}

/// Program loader backed by the kernel.
///
/// Every slot is a separate instance of a per-kind object file from
/// `object_dir`. The per-hook slot program arrays are pinned by name
/// under `pin_path` so all instances tail-call through the same array.
/// The parser instance is attached to every configured interface (XDP
/// on ingress, TC on egress).
pub struct EbpfSubstrate {
    object_dir: PathBuf,
    pin_path: PathBuf,
    interfaces: Vec<String>,
    inner: Mutex<Inner>,
}

impl EbpfSubstrate {
    pub fn new(object_dir: &Path, pin_path: &Path, interfaces: Vec<String>) -> Self {
        Self {
            object_dir: object_dir.to_path_buf(),
            pin_path: pin_path.to_path_buf(),
            interfaces,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn object(&self, inner: &mut Inner, name: &str) -> Result<Arc<Vec<u8>>, DomainError> {
        if let Some(bytes) = inner.objects.get(name) {
            return Ok(Arc::clone(bytes));
        }
        let path = self.object_dir.join(format!("{name}.bpf.o"));
        let bytes = Arc::new(
            std::fs::read(&path).map_err(|e| engine(format!("read {}", path.display()), e))?,
        );
        inner.objects.insert(name.to_string(), Arc::clone(&bytes));
        Ok(bytes)
    }

    fn instantiate(&self, spec: &ProgramSpec, bytes: &[u8]) -> Result<(Ebpf, ProgramFd), anyhow::Error> {
        let mut ebpf = EbpfLoader::new().map_pin_path(&self.pin_path).load(bytes)?;
        if spec.index == SLOT_PARSER
            && let Err(e) = aya_log::EbpfLogger::init(&mut ebpf)
        {
            warn!("eBPF logger init failed (non-fatal): {e}");
        }

        let entry = spec.hook.as_str();
        let fd = match spec.hook {
            Hook::Ingress => {
                let program: &mut Xdp = ebpf
                    .program_mut(entry)
                    .ok_or_else(|| anyhow::anyhow!("program '{entry}' not found in object"))?
                    .try_into()?;
                program.load()?;
                if spec.index == SLOT_PARSER {
                    for iface in &self.interfaces {
                        program.attach(iface, XdpFlags::default())?;
                        info!(interface = %iface, "parser attached (xdp)");
                    }
                }
                program.fd()?.try_clone()?
            }
            Hook::Egress => {
                let program: &mut SchedClassifier = ebpf
                    .program_mut(entry)
                    .ok_or_else(|| anyhow::anyhow!("program '{entry}' not found in object"))?
                    .try_into()?;
                program.load()?;
                if spec.index == SLOT_PARSER {
                    for iface in &self.interfaces {
                        if let Err(e) = tc::qdisc_add_clsact(iface) {
                            warn!(interface = %iface, error = %e, "qdisc_add_clsact failed (may already exist)");
                        }
                        program.attach(iface, TcAttachType::Egress)?;
                        info!(interface = %iface, "parser attached (tc egress)");
                    }
                }
                program.fd()?.try_clone()?
            }
        };
        Ok((ebpf, fd))
    }
}

impl ProgramLoaderPort for EbpfSubstrate {
    fn load(&self, spec: &ProgramSpec) -> Result<Arc<dyn ProgramHandle>, DomainError> {
        let mut inner = lock(&self.inner);
        let name = object_name(&spec.program);
        let bytes = self.object(&mut inner, &name)?;
        let (mut ebpf, fd) = self
            .instantiate(spec, &bytes)
            .map_err(|e| engine(format!("load {spec} from {name}"), e))?;

        let config_map = ebpf
            .take_map(SLOT_CONFIG_MAP)
            .ok_or_else(|| engine(&name, format!("map '{SLOT_CONFIG_MAP}' not found")))?;
        let config = Array::try_from(config_map).map_err(|e| engine(&name, e))?;
        let mut tables = BTreeMap::new();
        for (table, layout) in table_layout(&spec.program) {
            let map_name = table.to_ascii_uppercase();
            let map = ebpf
                .take_map(&map_name)
                .ok_or_else(|| engine(&name, format!("map '{map_name}' not found")))?;
            let handle = EbpfTable::new(table, layout, map).map_err(|e| engine(&name, e))?;
            tables.insert(table, Arc::new(handle));
        }

        if !inner.slot_arrays.contains_key(&spec.hook) {
            let slots_name = slots_map_name(spec.hook);
            let map = ebpf
                .take_map(slots_name)
                .ok_or_else(|| engine(&name, format!("map '{slots_name}' not found")))?;
            let array = ProgramArray::try_from(map).map_err(|e| engine(&name, e))?;
            inner.slot_arrays.insert(spec.hook, array);
        }

        let program = Arc::new(EbpfProgram {
            index: spec.index,
            hook: spec.hook,
            config: Mutex::new(config),
            tables,
            _ebpf: Mutex::new(ebpf),
        });
        program.write_config(&spec.program)?;

        let slots = inner
            .slot_arrays
            .get_mut(&spec.hook)
            .ok_or_else(|| engine(spec, "slot array missing"))?;
        slots
            .set(u32::from(spec.index), &fd, 0)
            .map_err(|e| engine(format!("place {spec}"), e))?;
        inner
            .slots
            .insert((spec.hook, spec.index), Arc::clone(&program));
        debug!(program = %spec, "program placed");
        Ok(program)
    }

    fn reload(&self, spec: &ProgramSpec) -> Result<(), DomainError> {
        let inner = lock(&self.inner);
        let program = inner
            .slots
            .get(&(spec.hook, spec.index))
            .ok_or_else(|| engine(format!("reload {spec}"), "slot is empty"))?;
        program.write_config(&spec.program)
    }

    fn unload(&self, index: u16, hook: Hook) -> Result<(), DomainError> {
        let mut inner = lock(&self.inner);
        let occupied = inner.slots.contains_key(&(hook, index));
        if occupied && let Some(slots) = inner.slot_arrays.get_mut(&hook) {
            slots
                .clear_index(&u32::from(index))
                .map_err(|e| engine(format!("clear slot {index}@{hook}"), e))?;
        }
        inner.slots.remove(&(hook, index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::common::entity::RuleAction;
    use ebpf_common::pipeline::CONNTRACK_MODE_ON;

    #[test]
    fn object_names_follow_stage_kind() {
        let stage = Program::Stage {
            chain: ChainName::Input,
            kind: StageKind::Field(MatchField::DstPort),
            next: None,
            default_action: RuleAction::Drop,
            rule_count: 1,
        };
        assert_eq!(object_name(&stage), "stage_portdst");
        assert_eq!(object_name(&Program::ConntrackTableUpdate), "conntrack_table_update");
    }

    #[test]
    fn selector_config_flags_empty_chains() {
        let config = slot_config(&Program::ChainSelector {
            defaults: [RuleAction::Accept, RuleAction::Drop, RuleAction::Accept],
            rule_counts: [0, 3, 0],
            allow_all: false,
        });
        assert_eq!(config.default_action, [1, 0, 1]);
        assert_eq!(config.flags, 0x2 | 0x8);
    }

    #[test]
    fn stage_config_carries_next_hop_and_default() {
        let config = slot_config(&Program::Stage {
            chain: ChainName::Output,
            kind: StageKind::BitScan,
            next: Some(16),
            default_action: RuleAction::Accept,
            rule_count: 5,
        });
        assert_eq!(config.next_hop, [16, NO_NEXT_HOP, NO_NEXT_HOP]);
        assert_eq!(config.rule_count, 5);
        assert_eq!(config.default_action, [0, 0, 1]);
    }

    #[test]
    fn forwarder_and_label_configs() {
        let forwarder = slot_config(&Program::ChainForwarder {
            entries: [Some(12), None, Some(7)],
            defaults: [RuleAction::Drop; 3],
        });
        assert_eq!(forwarder.next_hop, [12, NO_NEXT_HOP, 7]);
        let label = slot_config(&Program::ConntrackLabel {
            modes: [CONNTRACK_MODE_ON, 0, 0],
        });
        assert_eq!(label.conntrack_mode, [CONNTRACK_MODE_ON, 0, 0]);
    }

    #[test]
    fn action_stage_exposes_counters() {
        let tables: Vec<_> = table_layout(&Program::Stage {
            chain: ChainName::Input,
            kind: StageKind::Action,
            next: None,
            default_action: RuleAction::Drop,
            rule_count: 1,
        })
        .into_iter()
        .map(|(name, _)| name)
        .collect();
        assert_eq!(tables, vec!["actions", "pkts", "bytes"]);
    }

    #[test]
    fn missing_object_is_an_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = EbpfSubstrate::new(dir.path(), dir.path(), Vec::new());
        let err = substrate
            .load(&ProgramSpec {
                index: SLOT_PARSER,
                hook: Hook::Ingress,
                program: Program::Parser { horus_slot: None },
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("parser.bpf.o"));
    }
}
