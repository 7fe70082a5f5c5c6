#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::chain::entity::{ChainRule, IpNetwork, PacketInfo, TcpFlags};
use domain::chain::store::Chain;
use domain::common::entity::{ChainName, ConntrackStatus, L4Proto, RuleAction};
use domain::pipeline::builder::PipelineBuilder;
use domain::pipeline::entity::Bank;

const MAX_RULES: u32 = 256;
const RULE_BYTES: usize = 12;
const PACKET_BYTES: usize = 12;

// Fuzz the field compiler and pipeline planner against linear
// first-match evaluation.
//
// Layout:
//   [0]    = chain selector (0=INPUT, 1=FORWARD, 2=OUTPUT) and default
//   [1]    = number of rules (0-31)
//   next   = RULE_BYTES per rule
//   rest   = consumed in PACKET_BYTES chunks as packets
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let chain_name = ChainName::ALL[usize::from(data[0] % 3)];
    let default = if data[0] & 0x80 == 0 {
        RuleAction::Drop
    } else {
        RuleAction::Accept
    };
    let count = usize::from(data[1] % 32);
    let mut cursor = 2;

    let mut chain = Chain::new(chain_name, default, MAX_RULES as usize);
    for _ in 0..count {
        let Some(bytes) = data.get(cursor..cursor + RULE_BYTES) else {
            break;
        };
        cursor += RULE_BYTES;
        let rule = decode_rule(chain_name, bytes);
        if rule.validate_for(chain_name).is_ok() {
            let _ = chain.append(rule);
        }
    }

    let Ok(plan) = PipelineBuilder::new(MAX_RULES).build(&chain, Bank::default(), resolve) else {
        return;
    };
    assert_eq!(plan.rule_count, chain.len());

    for bytes in data[cursor..].chunks_exact(PACKET_BYTES) {
        let packet = decode_packet(bytes);
        let expected = chain
            .rules()
            .iter()
            .position(|r| r.matches(chain_name, &packet, resolve));
        let verdict = plan.classify(&packet);
        assert_eq!(verdict.rule, expected, "rules {:?} packet {packet:?}", chain.rules());
        let action = expected.map_or(default, |id| chain.rules()[id].action);
        assert_eq!(verdict.action, action);
    }
});

fn resolve(name: &str) -> Option<u32> {
    match name {
        "eth0" => Some(2),
        "eth1" => Some(3),
        _ => None,
    }
}

// Small value spaces so rules and packets collide often.
fn decode_rule(chain: ChainName, b: &[u8]) -> ChainRule {
    let present = b[0];
    let pick = |bit: u8| present & (1 << bit) != 0;
    let iface = if b[11] & 1 == 0 { "eth0" } else { "eth1" };
    let protos = [L4Proto::Tcp, L4Proto::Udp, L4Proto::Icmp, L4Proto::Gre];
    ChainRule {
        conntrack: pick(0).then(|| ConntrackStatus::ALL[usize::from(b[1] % 4)]),
        src: pick(1)
            .then(|| IpNetwork::new(0x0A00_0000 | u32::from(b[2] & 0x0F), 28 + b[3] % 5).ok())
            .flatten(),
        dst: pick(2)
            .then(|| IpNetwork::new(0xC0A8_0000 | u32::from(b[4] & 0x0F), 28 + b[5] % 5).ok())
            .flatten(),
        l4proto: pick(3).then(|| protos[usize::from(b[6] % 4)]),
        sport: pick(4).then(|| 1000 + u16::from(b[7] % 4)),
        dport: pick(5).then(|| 2000 + u16::from(b[8] % 4)),
        in_iface: (pick(6) && chain != ChainName::Output).then(|| iface.to_string()),
        out_iface: (pick(6) && chain == ChainName::Output).then(|| iface.to_string()),
        tcp_flags: pick(7).then(|| TcpFlags {
            set: b[9] & 0x17 & !b[10],
            clear: b[10] & 0x17,
        }),
        action: if b[11] & 2 == 0 {
            RuleAction::Drop
        } else {
            RuleAction::Accept
        },
    }
}

fn decode_packet(b: &[u8]) -> PacketInfo {
    PacketInfo {
        conntrack: ConntrackStatus::ALL[usize::from(b[0] % 4)],
        src_ip: 0x0A00_0000 | u32::from(b[1] & 0x1F),
        dst_ip: 0xC0A8_0000 | u32::from(b[2] & 0x1F),
        l4proto: [6, 17, 1, 47, 0][usize::from(b[3] % 5)],
        src_port: 1000 + u16::from(b[4] % 6),
        dst_port: 2000 + u16::from(b[5] % 6),
        in_ifindex: 1 + u32::from(b[6] % 3),
        out_ifindex: 1 + u32::from(b[7] % 3),
        tcp_flags: b[8] & 0x1F,
        len: u32::from(u16::from_le_bytes([b[9], b[10]])),
    }
}
