use std::collections::BTreeMap;

use ebpf_common::horus::{
    HORUS_PIN_DST_IP, HORUS_PIN_DST_PORT, HORUS_PIN_L4PROTO, HORUS_PIN_SRC_IP, HORUS_PIN_SRC_PORT,
    HorusKey, HorusValue,
};

use crate::chain::entity::{ChainRule, PacketInfo};
use crate::common::entity::RuleAction;

/// Bitmask of pinned key fields (`HORUS_PIN_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HorusSignature(pub u8);

impl HorusSignature {
    /// Signature of a rule, or `None` if the rule uses a field the
    /// exact-match key cannot express: conntrack state, a non-host
    /// address, an interface or TCP flags. A port without a protocol
    /// pins the port alone; the packet key masks the protocol out.
    pub fn of(rule: &ChainRule) -> Option<Self> {
        if rule.conntrack.is_some()
            || rule.in_iface.is_some()
            || rule.out_iface.is_some()
            || rule.tcp_flags.is_some()
            || rule.src.is_some_and(|n| !n.is_host())
            || rule.dst.is_some_and(|n| !n.is_host())
        {
            return None;
        }
        let mut bits = 0;
        if rule.src.is_some() {
            bits |= HORUS_PIN_SRC_IP;
        }
        if rule.dst.is_some() {
            bits |= HORUS_PIN_DST_IP;
        }
        if rule.l4proto.is_some() {
            bits |= HORUS_PIN_L4PROTO;
        }
        if rule.sport.is_some() {
            bits |= HORUS_PIN_SRC_PORT;
        }
        if rule.dport.is_some() {
            bits |= HORUS_PIN_DST_PORT;
        }
        Some(Self(bits))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn pins(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    /// Exact-match key of a rule with this signature.
    pub fn rule_key(self, rule: &ChainRule) -> HorusKey {
        HorusKey {
            src_ip: rule.src.map_or(0, |n| n.addr),
            dst_ip: rule.dst.map_or(0, |n| n.addr),
            src_port: rule.sport.unwrap_or(0),
            dst_port: rule.dport.unwrap_or(0),
            l4proto: rule.l4proto.map_or(0, |p| p.to_u8()),
            _pad: [0; 3],
        }
    }

    /// Lookup key of a packet: header fields masked to the signature.
    pub fn packet_key(self, packet: &PacketInfo) -> HorusKey {
        HorusKey {
            src_ip: if self.pins(HORUS_PIN_SRC_IP) { packet.src_ip } else { 0 },
            dst_ip: if self.pins(HORUS_PIN_DST_IP) { packet.dst_ip } else { 0 },
            src_port: if self.pins(HORUS_PIN_SRC_PORT) { packet.src_port } else { 0 },
            dst_port: if self.pins(HORUS_PIN_DST_PORT) { packet.dst_port } else { 0 },
            l4proto: if self.pins(HORUS_PIN_L4PROTO) { packet.l4proto } else { 0 },
            _pad: [0; 3],
        }
    }
}

/// Compiled fast-path table for the leading INPUT rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HorusTable {
    pub signature: HorusSignature,
    /// Number of leading rules the table covers.
    pub covered_rules: usize,
    pub entries: BTreeMap<HorusKey, HorusValue>,
}

impl HorusTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Action and rule id for a packet, if it hits the table.
    pub fn lookup(&self, packet: &PacketInfo) -> Option<(RuleAction, usize)> {
        self.entries
            .get(&self.signature.packet_key(packet))
            .map(|v| (RuleAction::from_u8(v.action), v.rule_id as usize))
    }
}
