//! Horus fast-path table layout.
//!
//! One exact-match table keyed on the pinned fields of a homogeneous
//! INPUT rule prefix. Unpinned key fields are zero.

/// Signature bits: which key fields are pinned.
pub const HORUS_PIN_SRC_IP: u8 = 1 << 0;
pub const HORUS_PIN_DST_IP: u8 = 1 << 1;
pub const HORUS_PIN_L4PROTO: u8 = 1 << 2;
pub const HORUS_PIN_SRC_PORT: u8 = 1 << 3;
pub const HORUS_PIN_DST_PORT: u8 = 1 << 4;

/// Minimum prefix length for the fast path to be worth enabling.
pub const MIN_RULES_FOR_HORUS: usize = 1;

/// Maximum number of entries in a Horus table.
pub const MAX_RULES_FOR_HORUS: usize = 2048;

/// Exact-match key (16 bytes). Addresses and ports in host byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HorusKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub l4proto: u8,
    pub _pad: [u8; 3],
}

/// Lookup result (8 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HorusValue {
    /// `ACTION_DROP` or `ACTION_ACCEPT`.
    pub action: u8,
    pub _pad: [u8; 3],
    /// Rule that produced this entry, for counter attribution.
    pub rule_id: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for HorusKey {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for HorusValue {}
