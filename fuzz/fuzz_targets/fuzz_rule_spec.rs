#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::chain::entity::{IpNetwork, RuleSpec, TcpFlags};
use domain::common::entity::ChainName;

// Fuzz textual rule parsing.
//
// The input is split on '\n' into the string fields of a RuleSpec
// (conntrack, src, dst, in_iface, out_iface, tcpflags, l4proto) followed
// by two ports. Parsing must never panic; accepted addresses must come
// back masked to their prefix.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if text.len() > 4096 {
        return;
    }

    let mut parts = text.split('\n');
    let mut field = || parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let spec = RuleSpec {
        conntrack: field(),
        src: field(),
        dst: field(),
        in_iface: field(),
        out_iface: field(),
        tcpflags: field(),
        l4proto: field(),
        sport: field().and_then(|s| s.parse().ok()),
        dport: field().and_then(|s| s.parse().ok()),
        ..RuleSpec::default()
    };

    if let Ok(rule) = spec.to_rule() {
        for chain in ChainName::ALL {
            let _ = rule.validate_for(chain);
        }
        for net in [rule.src, rule.dst].into_iter().flatten() {
            assert_eq!(net.addr & !net.mask(), 0, "unmasked network {net:?}");
            assert!(net.contains(net.addr));
        }
        if let Some(flags) = rule.tcp_flags {
            assert_eq!(flags.set & flags.clear, 0, "contradictory flags {flags:?}");
        }
    }

    let _ = text.parse::<IpNetwork>();
    let _ = text.parse::<TcpFlags>();
});
