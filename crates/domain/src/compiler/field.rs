use std::collections::BTreeMap;
use std::fmt;

use ebpf_common::pipeline::{
    STAGE_CONNTRACK_MATCH, STAGE_INTERFACE, STAGE_IP_DST, STAGE_IP_SRC, STAGE_L4PROTO,
    STAGE_PORT_DST, STAGE_PORT_SRC, STAGE_TCP_FLAGS, TCP_FLAG_COMBINATIONS,
};

use crate::chain::entity::{ChainRule, IpNetwork, PacketInfo};
use crate::chain::error::ChainError;
use crate::common::entity::{ChainName, ConntrackStatus};

use super::bitvector::BitVector;

/// A matchable rule field. Declaration order is the placement
/// priority used by the pipeline builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchField {
    Conntrack,
    SrcIp,
    DstIp,
    L4Proto,
    SrcPort,
    DstPort,
    Interface,
    TcpFlags,
}

impl MatchField {
    pub const PRIORITY: [MatchField; 8] = [
        Self::Conntrack,
        Self::SrcIp,
        Self::DstIp,
        Self::L4Proto,
        Self::SrcPort,
        Self::DstPort,
        Self::Interface,
        Self::TcpFlags,
    ];

    /// Slot offset of this field's stage inside a bank.
    pub fn stage_offset(self) -> u16 {
        match self {
            Self::Conntrack => STAGE_CONNTRACK_MATCH,
            Self::SrcIp => STAGE_IP_SRC,
            Self::DstIp => STAGE_IP_DST,
            Self::L4Proto => STAGE_L4PROTO,
            Self::SrcPort => STAGE_PORT_SRC,
            Self::DstPort => STAGE_PORT_DST,
            Self::Interface => STAGE_INTERFACE,
            Self::TcpFlags => STAGE_TCP_FLAGS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conntrack => "conntrack",
            Self::SrcIp => "ipsrc",
            Self::DstIp => "ipdst",
            Self::L4Proto => "l4proto",
            Self::SrcPort => "portsrc",
            Self::DstPort => "portdst",
            Self::Interface => "interface",
            Self::TcpFlags => "tcpflags",
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field value → rules matching that value.
///
/// Exact-match tables use key 0 for the synthesized wildcard entry;
/// IP tables use `0.0.0.0/0` and are looked up by longest prefix.
/// Conntrack and TCP flags are dense arrays over every possible value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTable {
    Conntrack(Vec<BitVector>),
    Ip(BTreeMap<IpNetwork, BitVector>),
    L4Proto(BTreeMap<u8, BitVector>),
    Port(BTreeMap<u16, BitVector>),
    Interface(BTreeMap<u32, BitVector>),
    TcpFlags(Vec<BitVector>),
}

impl FieldTable {
    pub fn len(&self) -> usize {
        match self {
            Self::Conntrack(v) | Self::TcpFlags(v) => v.len(),
            Self::Ip(m) => m.len(),
            Self::L4Proto(m) => m.len(),
            Self::Port(m) => m.len(),
            Self::Interface(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if the table carries a synthesized catch-all entry.
    pub fn has_wildcard_entry(&self) -> bool {
        match self {
            Self::Conntrack(_) | Self::TcpFlags(_) => false,
            Self::Ip(m) => m.contains_key(&IpNetwork::ANY),
            Self::L4Proto(m) => m.contains_key(&0),
            Self::Port(m) => m.contains_key(&0),
            Self::Interface(m) => m.contains_key(&0),
        }
    }
}

/// One field's compiled table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledField {
    pub field: MatchField,
    pub table: FieldTable,
    /// No rule wildcards this field: a lookup miss is conclusive.
    pub early_break: bool,
}

impl CompiledField {
    /// Rules still possible after looking the packet up in this table.
    /// `None` means the lookup missed and no rule can match.
    pub fn lookup(&self, chain: ChainName, packet: &PacketInfo) -> Option<&BitVector> {
        match &self.table {
            FieldTable::Conntrack(states) => states.get(usize::from(packet.conntrack.to_u8())),
            FieldTable::Ip(map) => {
                let ip = match self.field {
                    MatchField::SrcIp => packet.src_ip,
                    _ => packet.dst_ip,
                };
                map.iter()
                    .filter(|(net, _)| net.contains(ip))
                    .max_by_key(|(net, _)| net.prefix_len)
                    .map(|(_, bv)| bv)
            }
            FieldTable::L4Proto(map) => exact_or_wildcard(map, packet.l4proto),
            FieldTable::Port(map) => {
                let port = match self.field {
                    MatchField::SrcPort => packet.src_port,
                    _ => packet.dst_port,
                };
                exact_or_wildcard(map, port)
            }
            FieldTable::Interface(map) => exact_or_wildcard(map, packet.interface_for(chain)),
            FieldTable::TcpFlags(combos) => combos.get(usize::from(packet.tcp_flags)),
        }
    }
}

fn exact_or_wildcard<K: Ord + Default>(map: &BTreeMap<K, BitVector>, key: K) -> Option<&BitVector> {
    map.get(&key).or_else(|| map.get(&K::default()))
}

/// Turns a chain's rule list into per-field bitvector tables.
#[derive(Debug, Clone, Copy)]
pub struct FieldCompiler {
    max_rules: u32,
}

impl FieldCompiler {
    pub fn new(max_rules: u32) -> Self {
        Self { max_rules }
    }

    /// Compile every field some rule sets, in placement priority order.
    pub fn compile_all<F>(
        &self,
        chain: ChainName,
        rules: &[ChainRule],
        resolve: F,
    ) -> Result<Vec<CompiledField>, ChainError>
    where
        F: Fn(&str) -> Option<u32>,
    {
        let mut compiled = Vec::new();
        for field in MatchField::PRIORITY {
            if let Some(c) = self.compile(field, chain, rules, &resolve)? {
                compiled.push(c);
            }
        }
        Ok(compiled)
    }

    /// Compile one field. Returns `None` when every rule wildcards it.
    pub fn compile<F>(
        &self,
        field: MatchField,
        chain: ChainName,
        rules: &[ChainRule],
        resolve: F,
    ) -> Result<Option<CompiledField>, ChainError>
    where
        F: Fn(&str) -> Option<u32>,
    {
        let (table, early_break) = match field {
            MatchField::Conntrack => {
                let values: Vec<_> = rules.iter().map(|r| r.conntrack).collect();
                match self.dense(&values, ConntrackStatus::ALL.len(), |state, s| {
                    usize::from(state.to_u8()) == s
                }) {
                    Some((t, eb)) => (FieldTable::Conntrack(t), eb),
                    None => return Ok(None),
                }
            }
            MatchField::SrcIp | MatchField::DstIp => {
                let values: Vec<_> = rules
                    .iter()
                    .map(|r| if field == MatchField::SrcIp { r.src } else { r.dst })
                    .collect();
                let (map, eb) = self.prefixes(&values);
                (FieldTable::Ip(map), eb)
            }
            MatchField::L4Proto => {
                let values: Vec<_> = rules.iter().map(|r| r.l4proto.map(|p| p.to_u8())).collect();
                let (map, eb) = self.exact(&values);
                (FieldTable::L4Proto(map), eb)
            }
            MatchField::SrcPort | MatchField::DstPort => {
                let values: Vec<_> = rules
                    .iter()
                    .map(|r| if field == MatchField::SrcPort { r.sport } else { r.dport })
                    .collect();
                let (map, eb) = self.exact(&values);
                (FieldTable::Port(map), eb)
            }
            MatchField::Interface => {
                let values = rules
                    .iter()
                    .map(|r| {
                        r.interface_for(chain)
                            .map(|name| {
                                resolve(name).ok_or_else(|| ChainError::UnknownInterface {
                                    name: name.to_string(),
                                })
                            })
                            .transpose()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let (map, eb) = self.exact(&values);
                (FieldTable::Interface(map), eb)
            }
            MatchField::TcpFlags => {
                let values: Vec<_> = rules.iter().map(|r| r.tcp_flags).collect();
                match self.dense(&values, TCP_FLAG_COMBINATIONS, |flags, combo| {
                    u8::try_from(combo).is_ok_and(|c| flags.matches(c))
                }) {
                    Some((t, eb)) => (FieldTable::TcpFlags(t), eb),
                    None => return Ok(None),
                }
            }
        };
        if table.is_empty() {
            return Ok(None);
        }
        Ok(Some(CompiledField {
            field,
            table,
            early_break,
        }))
    }

    // ── Private helpers ────────────────────────────────────────────────

    /// Exact-match table over values that are never zero. Wildcard rules
    /// are OR'd into every entry and into a synthesized key-0 entry.
    fn exact<K>(&self, values: &[Option<K>]) -> (BTreeMap<K, BitVector>, bool)
    where
        K: Ord + Copy + Default,
    {
        let mut map: BTreeMap<K, BitVector> = values
            .iter()
            .flatten()
            .map(|k| (*k, BitVector::new(self.max_rules)))
            .collect();
        for (key, bv) in &mut map {
            for (rule, value) in values.iter().enumerate() {
                if value.is_none_or(|v| v == *key) {
                    bv.set(rule);
                }
            }
        }
        let wildcard = self.wildcard_rules(values);
        let early_break = wildcard.is_none();
        if let Some(bv) = wildcard
            && !map.is_empty()
        {
            map.insert(K::default(), bv);
        }
        (map, early_break)
    }

    /// Longest-prefix table. A rule matches a discovered prefix iff its
    /// own prefix covers it.
    fn prefixes(&self, values: &[Option<IpNetwork>]) -> (BTreeMap<IpNetwork, BitVector>, bool) {
        let mut map: BTreeMap<IpNetwork, BitVector> = values
            .iter()
            .flatten()
            .map(|net| (*net, BitVector::new(self.max_rules)))
            .collect();
        for (net, bv) in &mut map {
            for (rule, value) in values.iter().enumerate() {
                if value.is_none_or(|v| v.covers(net)) {
                    bv.set(rule);
                }
            }
        }
        let wildcard = self.wildcard_rules(values);
        let early_break = wildcard.is_none();
        if let Some(bv) = wildcard
            && !map.is_empty()
        {
            map.entry(IpNetwork::ANY).or_insert(bv);
        }
        (map, early_break)
    }

    /// Dense table with one entry per possible value, built only when
    /// some rule sets the field.
    fn dense<T, M>(&self, values: &[Option<T>], size: usize, matches: M) -> Option<(Vec<BitVector>, bool)>
    where
        T: Copy,
        M: Fn(T, usize) -> bool,
    {
        if values.iter().all(Option::is_none) {
            return None;
        }
        let table = (0..size)
            .map(|entry| {
                let mut bv = BitVector::new(self.max_rules);
                for (rule, value) in values.iter().enumerate() {
                    if value.is_none_or(|v| matches(v, entry)) {
                        bv.set(rule);
                    }
                }
                bv
            })
            .collect();
        Some((table, !values.iter().any(Option::is_none)))
    }

    fn wildcard_rules<T>(&self, values: &[Option<T>]) -> Option<BitVector> {
        let mut bv = BitVector::new(self.max_rules);
        let mut any = false;
        for (rule, _) in values.iter().enumerate().filter(|(_, v)| v.is_none()) {
            bv.set(rule);
            any = true;
        }
        any.then_some(bv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::{L4Proto, RuleAction};
    use ebpf_common::pipeline::{TCP_FLAG_ACK, TCP_FLAG_SYN};

    const MAX: u32 = 128;

    fn resolve(name: &str) -> Option<u32> {
        match name {
            "eth0" => Some(2),
            "eth1" => Some(3),
            _ => None,
        }
    }

    fn compile(field: MatchField, rules: &[ChainRule]) -> Option<CompiledField> {
        FieldCompiler::new(MAX)
            .compile(field, ChainName::Input, rules, resolve)
            .unwrap()
    }

    fn dport(port: u16) -> ChainRule {
        ChainRule {
            dport: Some(port),
            action: RuleAction::Accept,
            ..ChainRule::default()
        }
    }

    fn src(cidr: &str) -> ChainRule {
        ChainRule {
            src: Some(cidr.parse().unwrap()),
            ..ChainRule::default()
        }
    }

    fn ones(bv: &BitVector) -> Vec<usize> {
        bv.ones().collect()
    }

    #[test]
    fn unused_field_compiles_to_nothing() {
        assert!(compile(MatchField::SrcPort, &[dport(22)]).is_none());
        assert!(compile(MatchField::Conntrack, &[dport(22)]).is_none());
        assert!(compile(MatchField::TcpFlags, &[dport(22)]).is_none());
    }

    #[test]
    fn exact_without_wildcard_is_early_break() {
        let c = compile(MatchField::DstPort, &[dport(22), dport(80), dport(22)]).unwrap();
        assert!(c.early_break);
        let FieldTable::Port(map) = &c.table else {
            panic!("expected port table");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(ones(&map[&22]), vec![0, 2]);
        assert_eq!(ones(&map[&80]), vec![1]);
        assert!(!c.table.has_wildcard_entry());
    }

    #[test]
    fn wildcard_rules_join_every_entry() {
        let rules = [dport(22), ChainRule::default(), dport(80)];
        let c = compile(MatchField::DstPort, &rules).unwrap();
        assert!(!c.early_break);
        let FieldTable::Port(map) = &c.table else {
            panic!("expected port table");
        };
        assert_eq!(ones(&map[&22]), vec![0, 1]);
        assert_eq!(ones(&map[&80]), vec![1, 2]);
        assert_eq!(ones(&map[&0]), vec![1]);
    }

    #[test]
    fn prefix_entries_include_covering_rules() {
        let rules = [src("10.0.0.0/8"), src("10.1.0.0/16"), ChainRule::default()];
        let c = compile(MatchField::SrcIp, &rules).unwrap();
        assert!(!c.early_break);
        let FieldTable::Ip(map) = &c.table else {
            panic!("expected ip table");
        };
        assert_eq!(map.len(), 3);
        assert_eq!(ones(&map[&"10.0.0.0/8".parse().unwrap()]), vec![0, 2]);
        assert_eq!(ones(&map[&"10.1.0.0/16".parse().unwrap()]), vec![0, 1, 2]);
        assert_eq!(ones(&map[&IpNetwork::ANY]), vec![2]);
    }

    #[test]
    fn ip_lookup_uses_longest_prefix() {
        let rules = [src("10.0.0.0/8"), src("10.1.0.0/16")];
        let c = compile(MatchField::SrcIp, &rules).unwrap();
        let packet = PacketInfo {
            src_ip: 0x0A01_0203,
            ..PacketInfo::default()
        };
        assert_eq!(ones(c.lookup(ChainName::Input, &packet).unwrap()), vec![0, 1]);
        let other = PacketInfo {
            src_ip: 0x0B00_0001,
            ..PacketInfo::default()
        };
        assert!(c.lookup(ChainName::Input, &other).is_none());
    }

    #[test]
    fn conntrack_is_dense() {
        let rules = [
            ChainRule::accept_established(),
            ChainRule::default(),
            ChainRule {
                conntrack: Some(ConntrackStatus::New),
                ..ChainRule::default()
            },
        ];
        let c = compile(MatchField::Conntrack, &rules).unwrap();
        assert!(!c.early_break);
        let FieldTable::Conntrack(states) = &c.table else {
            panic!("expected conntrack table");
        };
        assert_eq!(states.len(), 4);
        assert_eq!(ones(&states[0]), vec![1, 2]);
        assert_eq!(ones(&states[1]), vec![0, 1]);
        assert_eq!(ones(&states[3]), vec![1]);
    }

    #[test]
    fn tcp_flags_cover_all_combinations() {
        let rules = [
            ChainRule {
                tcp_flags: Some("SYN !ACK".parse().unwrap()),
                l4proto: Some(L4Proto::Tcp),
                ..ChainRule::default()
            },
            ChainRule {
                tcp_flags: Some("!SYN".parse().unwrap()),
                ..ChainRule::default()
            },
        ];
        let c = compile(MatchField::TcpFlags, &rules).unwrap();
        assert!(c.early_break);
        let FieldTable::TcpFlags(combos) = &c.table else {
            panic!("expected flags table");
        };
        assert_eq!(combos.len(), 256);
        assert_eq!(ones(&combos[usize::from(TCP_FLAG_SYN)]), vec![0]);
        assert!(combos[usize::from(TCP_FLAG_SYN | TCP_FLAG_ACK)].is_empty());
        assert_eq!(ones(&combos[usize::from(TCP_FLAG_ACK)]), vec![1]);
        assert_eq!(ones(&combos[0]), vec![1]);
    }

    #[test]
    fn interface_uses_chain_direction() {
        let rules = [ChainRule {
            in_iface: Some("eth0".to_string()),
            out_iface: Some("eth1".to_string()),
            ..ChainRule::default()
        }];
        let compiler = FieldCompiler::new(MAX);
        let fwd = compiler
            .compile(MatchField::Interface, ChainName::Forward, &rules, resolve)
            .unwrap()
            .unwrap();
        let FieldTable::Interface(map) = &fwd.table else {
            panic!("expected interface table");
        };
        assert!(map.contains_key(&2));
        let out = compiler
            .compile(MatchField::Interface, ChainName::Output, &rules, resolve)
            .unwrap()
            .unwrap();
        let FieldTable::Interface(map) = &out.table else {
            panic!("expected interface table");
        };
        assert!(map.contains_key(&3));
    }

    #[test]
    fn unknown_interface_is_an_error() {
        let rules = [ChainRule {
            in_iface: Some("wlan9".to_string()),
            ..ChainRule::default()
        }];
        let err = FieldCompiler::new(MAX)
            .compile(MatchField::Interface, ChainName::Input, &rules, resolve)
            .unwrap_err();
        assert!(matches!(err, ChainError::UnknownInterface { .. }));
    }

    #[test]
    fn every_constrained_rule_appears_and_mismatches_never_do() {
        let rules = [dport(22), dport(80), ChainRule::default(), dport(443)];
        let c = compile(MatchField::DstPort, &rules).unwrap();
        let FieldTable::Port(map) = &c.table else {
            panic!("expected port table");
        };
        for (rule, r) in rules.iter().enumerate() {
            let Some(port) = r.dport else { continue };
            let hits = map.values().filter(|bv| bv.get(rule)).count();
            assert!(hits >= 1);
            for (key, bv) in map {
                if *key != port {
                    assert!(!bv.get(rule), "rule {rule} leaked into entry {key}");
                }
            }
        }
    }

    #[test]
    fn compile_all_follows_priority() {
        let rules = [ChainRule {
            dport: Some(22),
            src: Some("10.0.0.1".parse().unwrap()),
            l4proto: Some(L4Proto::Tcp),
            ..ChainRule::default()
        }];
        let fields: Vec<_> = FieldCompiler::new(MAX)
            .compile_all(ChainName::Input, &rules, resolve)
            .unwrap()
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(
            fields,
            vec![MatchField::SrcIp, MatchField::L4Proto, MatchField::DstPort]
        );
    }
}
