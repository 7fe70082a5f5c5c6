use std::collections::BTreeMap;

use domain::common::entity::ChainName;
use domain::pipeline::entity::PacketCounters;

/// A rule-list edit made after the serving generation was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Insert(usize),
    Delete(usize),
}

#[derive(Debug, Default)]
struct ChainLedger {
    rules: Vec<PacketCounters>,
    default: PacketCounters,
    edits: Vec<Edit>,
}

impl ChainLedger {
    /// Position today of the rule the serving generation calls `id`.
    fn current_position(&self, id: usize) -> Option<usize> {
        let mut pos = id;
        for edit in &self.edits {
            match *edit {
                Edit::Insert(at) if pos >= at => pos += 1,
                Edit::Delete(at) if pos == at => return None,
                Edit::Delete(at) if pos > at => pos -= 1,
                _ => {}
            }
        }
        Some(pos)
    }
}

/// Accumulated per-rule and default-action totals.
///
/// Datapath counters are indexed by the rule ids of the generation that
/// produced them. Edits recorded since that generation went live are
/// replayed to find where those rules sit now.
#[derive(Debug, Default)]
pub struct CounterLedger {
    chains: BTreeMap<ChainName, ChainLedger>,
}

impl CounterLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain_mut(&mut self, chain: ChainName) -> &mut ChainLedger {
        self.chains.entry(chain).or_default()
    }

    pub fn rule_inserted(&mut self, chain: ChainName, id: usize) {
        let ledger = self.chain_mut(chain);
        let at = id.min(ledger.rules.len());
        ledger.rules.insert(at, PacketCounters::default());
        ledger.edits.push(Edit::Insert(at));
    }

    pub fn rule_deleted(&mut self, chain: ChainName, id: usize) {
        let ledger = self.chain_mut(chain);
        if id < ledger.rules.len() {
            ledger.rules.remove(id);
        }
        ledger.edits.push(Edit::Delete(id));
    }

    /// Fold counters read from the serving generation's rule `id`.
    pub fn add_generation(&mut self, chain: ChainName, id: usize, counters: PacketCounters) {
        if counters == PacketCounters::default() {
            return;
        }
        let ledger = self.chain_mut(chain);
        let Some(pos) = ledger.current_position(id) else {
            return;
        };
        if pos >= ledger.rules.len() {
            ledger.rules.resize(pos + 1, PacketCounters::default());
        }
        ledger.rules[pos].add(counters);
    }

    pub fn add_default(&mut self, chain: ChainName, counters: PacketCounters) {
        self.chain_mut(chain).default.add(counters);
    }

    /// A new generation now serves the current rule list.
    pub fn generation_activated(&mut self, chain: ChainName) {
        self.chain_mut(chain).edits.clear();
    }

    pub fn rule(&self, chain: ChainName, id: usize) -> PacketCounters {
        self.chains
            .get(&chain)
            .and_then(|l| l.rules.get(id).copied())
            .unwrap_or_default()
    }

    pub fn default_action(&self, chain: ChainName) -> PacketCounters {
        self.chains
            .get(&chain)
            .map(|l| l.default)
            .unwrap_or_default()
    }

    /// Zero the totals; pending edits are kept.
    pub fn reset(&mut self, chain: ChainName) {
        let ledger = self.chain_mut(chain);
        ledger.rules.fill(PacketCounters::default());
        ledger.default = PacketCounters::default();
    }
}
