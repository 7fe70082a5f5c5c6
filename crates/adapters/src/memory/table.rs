use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use domain::common::error::DomainError;
use ports::secondary::program_loader_port::{TableHandle, TableKey, TableKind, TableValue};

/// A program table held in a `BTreeMap`. Per-cpu arrays are modelled
/// as a single CPU.
pub struct MemoryTable {
    kind: TableKind,
    entries: Mutex<BTreeMap<TableKey, TableValue>>,
}

impl MemoryTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<TableKey, TableValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Increment a counter entry, creating it at zero.
    pub fn add(&self, key: TableKey, delta: u64) {
        let mut entries = self.entries();
        let current = entries.get(&key).map_or(0, TableValue::as_counter);
        entries.insert(key, TableValue::Counter(current.saturating_add(delta)));
    }

    /// Value of the longest stored prefix containing `ip`.
    pub fn longest_prefix(&self, ip: u32) -> Option<TableValue> {
        self.entries()
            .iter()
            .filter_map(|(key, value)| match key {
                TableKey::Prefix(net) if net.contains(ip) => Some((net.prefix_len, value)),
                _ => None,
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, value)| value.clone())
    }
}

impl TableHandle for MemoryTable {
    fn kind(&self) -> TableKind {
        self.kind
    }

    fn get(&self, key: &TableKey) -> Result<Option<TableValue>, DomainError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: TableKey, value: TableValue) -> Result<(), DomainError> {
        if self.kind == TableKind::LongestPrefixMatch && !matches!(key, TableKey::Prefix(_)) {
            return Err(DomainError::EngineError(format!(
                "prefix table cannot hold key {key:?}"
            )));
        }
        self.entries().insert(key, value);
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<(TableKey, TableValue)>, DomainError> {
        Ok(self
            .entries()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let table = MemoryTable::new(TableKind::PerCpuArray);
        table.add(TableKey::Index(3), 2);
        table.add(TableKey::Index(3), 5);
        assert_eq!(
            table.get(&TableKey::Index(3)).unwrap(),
            Some(TableValue::Counter(7))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn longest_prefix_wins() {
        let table = MemoryTable::new(TableKind::LongestPrefixMatch);
        table
            .set(
                TableKey::Prefix("0.0.0.0/0".parse().unwrap()),
                TableValue::Bitvector(vec![1]),
            )
            .unwrap();
        table
            .set(
                TableKey::Prefix("192.168.0.0/16".parse().unwrap()),
                TableValue::Bitvector(vec![3]),
            )
            .unwrap();
        let ip = u32::from(std::net::Ipv4Addr::new(192, 168, 4, 4));
        assert_eq!(table.longest_prefix(ip), Some(TableValue::Bitvector(vec![3])));
        let other = u32::from(std::net::Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(table.longest_prefix(other), Some(TableValue::Bitvector(vec![1])));
    }

    #[test]
    fn prefix_table_rejects_other_keys() {
        let table = MemoryTable::new(TableKind::LongestPrefixMatch);
        assert!(table.set(TableKey::Port(80), TableValue::Action(1)).is_err());
        assert!(table.is_empty());
    }
}
