use std::sync::{Mutex, MutexGuard, PoisonError};

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Array, HashMap, Map, MapData, MapError, PerCpuArray, PerCpuValues};
use domain::chain::entity::IpNetwork;
use domain::common::error::DomainError;
use ebpf_common::horus::{HorusKey, HorusValue};
use ebpf_common::pipeline::MAX_BITVECTOR_WORDS;
use ports::secondary::program_loader_port::{TableHandle, TableKey, TableKind, TableValue};

type Bits = [u64; MAX_BITVECTOR_WORDS];

/// Key/value layout of a kernel table, chosen per program kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLayout {
    IpBits,
    PortBits,
    ProtoBits,
    IfindexBits,
    DenseBits,
    Actions,
    Counters,
    Horus,
}

enum Store {
    IpBits(LpmTrie<MapData, [u8; 4], Bits>),
    PortBits(HashMap<MapData, u16, Bits>),
    ProtoBits(HashMap<MapData, u8, Bits>),
    IfindexBits(HashMap<MapData, u32, Bits>),
    DenseBits(Array<MapData, Bits>),
    Actions(Array<MapData, u8>),
    Counters(PerCpuArray<MapData, u64>),
    Horus(HashMap<MapData, HorusKey, HorusValue>),
}

/// A kernel map behind the typed table interface.
pub struct EbpfTable {
    name: String,
    kind: TableKind,
    store: Mutex<Store>,
}

fn map_err(table: &str, op: &str, e: impl std::fmt::Display) -> DomainError {
    DomainError::EngineError(format!("{op} on table {table} failed: {e}"))
}

fn to_bits(words: &[u64]) -> Result<Bits, DomainError> {
    if words.len() > MAX_BITVECTOR_WORDS {
        return Err(DomainError::ResourceExhausted(format!(
            "bitvector of {} words exceeds {MAX_BITVECTOR_WORDS}",
            words.len()
        )));
    }
    let mut bits = [0u64; MAX_BITVECTOR_WORDS];
    bits[..words.len()].copy_from_slice(words);
    Ok(bits)
}

fn lpm_key(net: &IpNetwork) -> Key<[u8; 4]> {
    Key::new(u32::from(net.prefix_len), net.addr.to_be_bytes())
}

/// A missing key is not an error for lookups.
fn found<V>(table: &str, result: Result<V, MapError>) -> Result<Option<V>, DomainError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(MapError::KeyNotFound) => Ok(None),
        Err(e) => Err(map_err(table, "get", e)),
    }
}

fn cpu_sum(values: &PerCpuValues<u64>) -> u64 {
    values.iter().copied().fold(0, u64::saturating_add)
}

impl EbpfTable {
    pub fn new(name: &str, layout: TableLayout, map: Map) -> Result<Self, anyhow::Error> {
        let (kind, store) = match layout {
            TableLayout::IpBits => (
                TableKind::LongestPrefixMatch,
                Store::IpBits(LpmTrie::try_from(map)?),
            ),
            TableLayout::PortBits => (TableKind::ExactMatch, Store::PortBits(HashMap::try_from(map)?)),
            TableLayout::ProtoBits => (TableKind::ExactMatch, Store::ProtoBits(HashMap::try_from(map)?)),
            TableLayout::IfindexBits => (
                TableKind::ExactMatch,
                Store::IfindexBits(HashMap::try_from(map)?),
            ),
            TableLayout::DenseBits => (TableKind::Array, Store::DenseBits(Array::try_from(map)?)),
            TableLayout::Actions => (TableKind::Array, Store::Actions(Array::try_from(map)?)),
            TableLayout::Counters => (
                TableKind::PerCpuArray,
                Store::Counters(PerCpuArray::try_from(map)?),
            ),
            TableLayout::Horus => (TableKind::ExactMatch, Store::Horus(HashMap::try_from(map)?)),
        };
        Ok(Self {
            name: name.to_string(),
            kind,
            store: Mutex::new(store),
        })
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mismatch(&self, key: &TableKey) -> DomainError {
        DomainError::EngineError(format!("table {} cannot hold key {key:?}", self.name))
    }
}

impl TableHandle for EbpfTable {
    fn kind(&self) -> TableKind {
        self.kind
    }

    fn get(&self, key: &TableKey) -> Result<Option<TableValue>, DomainError> {
        let store = self.store();
        let bits = |b: Bits| TableValue::Bitvector(b.to_vec());
        let value = match (&*store, key) {
            (Store::IpBits(t), TableKey::Prefix(net)) => found(&self.name, t.get(&lpm_key(net), 0))?.map(bits),
            (Store::PortBits(t), TableKey::Port(p)) => found(&self.name, t.get(p, 0))?.map(bits),
            (Store::ProtoBits(t), TableKey::Proto(p)) => found(&self.name, t.get(p, 0))?.map(bits),
            (Store::IfindexBits(t), TableKey::Ifindex(i)) => found(&self.name, t.get(i, 0))?.map(bits),
            (Store::DenseBits(t), TableKey::Index(i)) => found(&self.name, t.get(i, 0))?.map(bits),
            (Store::Actions(t), TableKey::Index(i)) => found(&self.name, t.get(i, 0))?.map(TableValue::Action),
            (Store::Counters(t), TableKey::Index(i)) => {
                found(&self.name, t.get(i, 0))?.map(|v| TableValue::Counter(cpu_sum(&v)))
            }
            (Store::Horus(t), TableKey::Horus(k)) => found(&self.name, t.get(k, 0))?.map(TableValue::Horus),
            _ => return Err(self.mismatch(key)),
        };
        Ok(value)
    }

    fn set(&self, key: TableKey, value: TableValue) -> Result<(), DomainError> {
        let mut store = self.store();
        let err = |e: MapError| map_err(&self.name, "set", e);
        match (&mut *store, key, value) {
            (Store::IpBits(t), TableKey::Prefix(net), TableValue::Bitvector(w)) => {
                t.insert(&lpm_key(&net), to_bits(&w)?, 0).map_err(err)
            }
            (Store::PortBits(t), TableKey::Port(p), TableValue::Bitvector(w)) => {
                t.insert(p, to_bits(&w)?, 0).map_err(err)
            }
            (Store::ProtoBits(t), TableKey::Proto(p), TableValue::Bitvector(w)) => {
                t.insert(p, to_bits(&w)?, 0).map_err(err)
            }
            (Store::IfindexBits(t), TableKey::Ifindex(i), TableValue::Bitvector(w)) => {
                t.insert(i, to_bits(&w)?, 0).map_err(err)
            }
            (Store::DenseBits(t), TableKey::Index(i), TableValue::Bitvector(w)) => {
                t.set(i, to_bits(&w)?, 0).map_err(err)
            }
            (Store::Actions(t), TableKey::Index(i), TableValue::Action(a)) => t.set(i, a, 0).map_err(err),
            (Store::Counters(t), TableKey::Index(i), TableValue::Counter(n)) => {
                let cpus = aya::util::nr_cpus()
                    .map_err(|(msg, e)| map_err(&self.name, "set", format!("{msg}: {e}")))?;
                let values = PerCpuValues::try_from(vec![n; cpus])
                    .map_err(|e| map_err(&self.name, "set", e))?;
                t.set(i, values, 0).map_err(err)
            }
            (Store::Horus(t), TableKey::Horus(k), TableValue::Horus(v)) => t.insert(k, v, 0).map_err(err),
            (_, key, _) => Err(self.mismatch(&key)),
        }
    }

    fn get_all(&self) -> Result<Vec<(TableKey, TableValue)>, DomainError> {
        let store = self.store();
        let err = |e: MapError| map_err(&self.name, "iterate", e);
        let bits = |b: Bits| TableValue::Bitvector(b.to_vec());
        let mut out = Vec::new();
        match &*store {
            Store::IpBits(t) => {
                for entry in t.iter() {
                    let (key, value) = entry.map_err(err)?;
                    let addr = u32::from_be_bytes(key.data());
                    let prefix = u8::try_from(key.prefix_len()).unwrap_or(32);
                    let net = IpNetwork::new(addr, prefix).map_err(|e| map_err(&self.name, "iterate", e))?;
                    out.push((TableKey::Prefix(net), bits(value)));
                }
            }
            Store::PortBits(t) => {
                for entry in t.iter() {
                    let (k, v) = entry.map_err(err)?;
                    out.push((TableKey::Port(k), bits(v)));
                }
            }
            Store::ProtoBits(t) => {
                for entry in t.iter() {
                    let (k, v) = entry.map_err(err)?;
                    out.push((TableKey::Proto(k), bits(v)));
                }
            }
            Store::IfindexBits(t) => {
                for entry in t.iter() {
                    let (k, v) = entry.map_err(err)?;
                    out.push((TableKey::Ifindex(k), bits(v)));
                }
            }
            Store::DenseBits(t) => {
                for (i, entry) in t.iter().enumerate() {
                    let v = entry.map_err(err)?;
                    out.push((TableKey::Index(index_of(i)), bits(v)));
                }
            }
            Store::Actions(t) => {
                for (i, entry) in t.iter().enumerate() {
                    out.push((TableKey::Index(index_of(i)), TableValue::Action(entry.map_err(err)?)));
                }
            }
            Store::Counters(t) => {
                for (i, entry) in t.iter().enumerate() {
                    let total = cpu_sum(&entry.map_err(err)?);
                    if total > 0 {
                        out.push((TableKey::Index(index_of(i)), TableValue::Counter(total)));
                    }
                }
            }
            Store::Horus(t) => {
                for entry in t.iter() {
                    let (k, v) = entry.map_err(err)?;
                    out.push((TableKey::Horus(k), TableValue::Horus(v)));
                }
            }
        }
        Ok(out)
    }
}

fn index_of(i: usize) -> u32 {
    u32::try_from(i).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_zero_padded() {
        let bits = to_bits(&[1, 2]).unwrap();
        assert_eq!(bits[0], 1);
        assert_eq!(bits[1], 2);
        assert!(bits[2..].iter().all(|w| *w == 0));
    }

    #[test]
    fn oversized_bitvector_is_rejected() {
        let words = vec![0u64; MAX_BITVECTOR_WORDS + 1];
        assert!(to_bits(&words).is_err());
    }

    #[test]
    fn lpm_key_uses_network_order() {
        let net: IpNetwork = "10.1.0.0/16".parse().unwrap();
        let key = lpm_key(&net);
        assert_eq!(key.prefix_len(), 16);
        assert_eq!(key.data(), [10, 1, 0, 0]);
    }

    #[test]
    fn lookup_errors_become_engine_errors() {
        assert_eq!(found("actions", Ok::<_, MapError>(7u8)).unwrap(), Some(7));
        assert_eq!(found::<u8>("actions", Err(MapError::KeyNotFound)).unwrap(), None);
        let err = found::<u8>(
            "actions",
            Err(MapError::OutOfBounds {
                index: 9,
                max_entries: 4,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::EngineError(ref m) if m.contains("get on table actions")));
    }
}
