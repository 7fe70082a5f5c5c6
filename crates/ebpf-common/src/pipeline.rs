//! Slot layout and table encodings shared by the userspace control plane
//! and the pipeline programs.
//!
//! Each hook (ingress for INPUT/FORWARD, egress for OUTPUT) owns a program
//! array. The first `NR_INITIAL_MODULES` slots hold the fixed entry programs;
//! matching stages live in two alternating banks after them.

// ── Rule limits and bitvector addressing ────────────────────────────

/// Maximum number of rules per chain.
pub const MAX_RULES: u32 = 8192;

/// Rule bits carried per 64-bit bitvector word. The top bit of every word
/// is left unused.
pub const RULES_PER_WORD: u32 = 63;

/// Number of 64-bit words needed to address `max_rules` rules.
pub const fn bitvector_words(max_rules: u32) -> usize {
    max_rules.div_ceil(RULES_PER_WORD) as usize
}

/// Bitvector length (in words) for `MAX_RULES`.
pub const MAX_BITVECTOR_WORDS: usize = bitvector_words(MAX_RULES);

// ── Fixed entry slots ───────────────────────────────────────────────

pub const SLOT_PARSER: u16 = 0;
pub const SLOT_CHAIN_SELECTOR: u16 = 1;
pub const SLOT_CONNTRACK_LABEL: u16 = 2;
pub const SLOT_CHAIN_FORWARDER: u16 = 3;
pub const SLOT_CONNTRACK_TABLE_UPDATE: u16 = 4;
/// Horus fast path, primary bank (ingress only).
pub const SLOT_HORUS: u16 = 5;
/// Horus fast path, swap bank (ingress only).
pub const SLOT_HORUS_SWAP: u16 = 6;

/// Slots reserved for the fixed entry programs.
pub const NR_INITIAL_MODULES: u16 = 7;

// ── Stage offsets inside a bank ─────────────────────────────────────

pub const STAGE_CONNTRACK_MATCH: u16 = 0;
pub const STAGE_IP_SRC: u16 = 1;
pub const STAGE_IP_DST: u16 = 2;
pub const STAGE_L4PROTO: u16 = 3;
pub const STAGE_PORT_SRC: u16 = 4;
pub const STAGE_PORT_DST: u16 = 5;
pub const STAGE_INTERFACE: u16 = 6;
pub const STAGE_TCP_FLAGS: u16 = 7;
pub const STAGE_BITSCAN: u16 = 8;
pub const STAGE_ACTION: u16 = 9;

/// Stage slots per bank.
pub const NR_MODULES: u16 = 10;

/// Offset of the FORWARD chain banks relative to INPUT on the shared
/// ingress hook.
pub const FORWARD_BANK_SHIFT: u16 = 2 * NR_MODULES;

/// First slot of a chain's stage bank.
pub const fn stage_bank_base(forward: bool, bank: u8) -> u16 {
    let base = NR_INITIAL_MODULES + bank as u16 * NR_MODULES;
    if forward { base + FORWARD_BANK_SHIFT } else { base }
}

/// Highest slot index used on any hook, plus one.
pub const PROGRAM_ARRAY_SIZE: u32 = (NR_INITIAL_MODULES + 4 * NR_MODULES) as u32;

// ── Actions ─────────────────────────────────────────────────────────

pub const ACTION_DROP: u8 = 0;
pub const ACTION_ACCEPT: u8 = 1;

// ── Connection tracking ─────────────────────────────────────────────

/// Connection states as labelled by the conntrack label program.
pub const CT_NEW: u8 = 0;
pub const CT_ESTABLISHED: u8 = 1;
pub const CT_RELATED: u8 = 2;
pub const CT_INVALID: u8 = 3;
pub const CT_STATE_COUNT: u8 = 4;

/// Per-chain accept-established mode of the conntrack label program.
pub const CONNTRACK_MODE_DISABLED: u8 = 0;
pub const CONNTRACK_MODE_ON: u8 = 1;
pub const CONNTRACK_MODE_OFF: u8 = 2;

// ── TCP flags (bit positions in the 8-bit flags byte) ───────────────

pub const TCP_FLAG_FIN: u8 = 1 << 0;
pub const TCP_FLAG_SYN: u8 = 1 << 1;
pub const TCP_FLAG_RST: u8 = 1 << 2;
pub const TCP_FLAG_PSH: u8 = 1 << 3;
pub const TCP_FLAG_ACK: u8 = 1 << 4;
pub const TCP_FLAG_URG: u8 = 1 << 5;
pub const TCP_FLAG_ECE: u8 = 1 << 6;
pub const TCP_FLAG_CWR: u8 = 1 << 7;

/// Number of distinct TCP flag combinations.
pub const TCP_FLAG_COMBINATIONS: usize = 256;

// ── L4 protocol numbers ─────────────────────────────────────────────

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_GRE: u8 = 47;

// ── Chain indices in per-chain arrays ───────────────────────────────

pub const CHAIN_INDEX_INPUT: u32 = 0;
pub const CHAIN_INDEX_FORWARD: u32 = 1;
pub const CHAIN_INDEX_OUTPUT: u32 = 2;
pub const CHAIN_COUNT: u32 = 3;

// ── Table names ─────────────────────────────────────────────────────

/// Field stage: value → bitvector.
pub const TABLE_BITVECTORS: &str = "bitvectors";
/// Action stage: rule id → action.
pub const TABLE_ACTIONS: &str = "actions";
/// Action stage: per-rule packet counters (per-cpu).
pub const TABLE_PKTS: &str = "pkts";
/// Action stage: per-rule byte counters (per-cpu).
pub const TABLE_BYTES: &str = "bytes";
/// Horus: key → (action, rule id).
pub const TABLE_HORUS: &str = "horus";
pub const TABLE_HORUS_PKTS: &str = "pkts_horus";
pub const TABLE_HORUS_BYTES: &str = "bytes_horus";
/// Conntrack label: per-chain accept-established counters.
pub const TABLE_ACCEPT_ESTABLISHED_PKTS: &str = "pkts_acceptestablished";
pub const TABLE_ACCEPT_ESTABLISHED_BYTES: &str = "bytes_acceptestablished";
/// Chain selector: per-chain default action counters.
pub const TABLE_DEFAULT_PKTS: &str = "pkts_default";
pub const TABLE_DEFAULT_BYTES: &str = "bytes_default";
/// Conntrack table update: current time in nanoseconds (per-cpu).
pub const TABLE_TIMESTAMP: &str = "timestamp";

// ── Per-slot configuration ──────────────────────────────────────────

/// Runtime parameters of one slot, written on every load/reload.
///
/// Fields are interpreted per program kind; unused fields are zero.
/// `next_hop` entries use `u16::MAX` for "no target".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConfig {
    /// Tail-call targets: stage successor, or per-chain entry points
    /// (`CHAIN_INDEX_*` order) for the forwarder, or the active Horus
    /// slot in `next_hop[0]` for the parser.
    pub next_hop: [u16; 3],
    /// Number of live rules (stages) or Horus signature (Horus slot).
    pub rule_count: u16,
    /// Default action per chain (`CHAIN_INDEX_*` order).
    pub default_action: [u8; 3],
    /// Conntrack mode per chain (`CHAIN_INDEX_*` order).
    pub conntrack_mode: [u8; 3],
    /// Program-specific flag bits (`SLOT_FLAG_*`).
    pub flags: u16,
}

/// Sentinel for an unset `next_hop`.
pub const NO_NEXT_HOP: u16 = u16::MAX;

/// Chain selector: accept all ingress traffic without consulting a chain.
pub const SLOT_FLAG_ALLOW_ALL: u16 = 0x0001;

/// Chain selector: the chain at `chain_index` has no rules.
pub const fn slot_flag_chain_empty(chain_index: u32) -> u16 {
    1 << (1 + chain_index)
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for SlotConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn bitvector_words_rounds_up() {
        assert_eq!(bitvector_words(1), 1);
        assert_eq!(bitvector_words(63), 1);
        assert_eq!(bitvector_words(64), 2);
        assert_eq!(MAX_BITVECTOR_WORDS, 131);
    }

    #[test]
    fn banks_do_not_overlap() {
        let input0 = stage_bank_base(false, 0);
        let input1 = stage_bank_base(false, 1);
        let fwd0 = stage_bank_base(true, 0);
        let fwd1 = stage_bank_base(true, 1);
        assert_eq!(input0, 7);
        assert_eq!(input1, 17);
        assert_eq!(fwd0, 27);
        assert_eq!(fwd1, 37);
        assert!(u32::from(fwd1 + NR_MODULES) <= PROGRAM_ARRAY_SIZE);
    }

    #[test]
    fn fixed_slots_precede_banks() {
        assert!(SLOT_HORUS_SWAP < NR_INITIAL_MODULES);
        assert_eq!(STAGE_ACTION + 1, NR_MODULES);
    }

    #[test]
    fn chain_empty_flags_are_distinct() {
        let flags = [
            slot_flag_chain_empty(CHAIN_INDEX_INPUT),
            slot_flag_chain_empty(CHAIN_INDEX_FORWARD),
            slot_flag_chain_empty(CHAIN_INDEX_OUTPUT),
        ];
        assert_eq!(flags, [0x2, 0x4, 0x8]);
        assert!(flags.iter().all(|f| f & SLOT_FLAG_ALLOW_ALL == 0));
    }

    #[test]
    fn slot_config_layout() {
        assert_eq!(mem::size_of::<SlotConfig>(), 16);
        assert_eq!(mem::align_of::<SlotConfig>(), 2);
    }
}
