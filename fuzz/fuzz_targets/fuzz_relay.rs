//! Fuzz target for relay state handling.
//!
//! Drives a relay with an arbitrary sequence of connects, lines and
//! disconnects, then checks that nick and channel bookkeeping still agree.

#![no_main]

use arbitrary::Arbitrary;
use chanrelay::server::{ConnId, Relay, RelayOptions};
use libfuzzer_sys::fuzz_target;

const SLOTS: usize = 4;

#[derive(Debug, Arbitrary)]
enum Op {
    Open,
    Close { slot: u8 },
    Line { slot: u8, line: String },
    Bytes { slot: u8, data: Vec<u8> },
    Drain { slot: u8 },
}

#[derive(Debug, Arbitrary)]
struct Script {
    echo_to_sender: bool,
    tag_sender: bool,
    max_pending: u8,
    ops: Vec<Op>,
}

fuzz_target!(|script: Script| {
    let mut relay = Relay::new(RelayOptions {
        echo_to_sender: script.echo_to_sender,
        tag_sender: script.tag_sender,
        max_pending: usize::from(script.max_pending),
    });
    let mut slots: Vec<ConnId> = Vec::new();
    let pick = |slots: &[ConnId], slot: u8| {
        (!slots.is_empty()).then(|| slots[usize::from(slot) % slots.len()])
    };

    for op in script.ops {
        match op {
            Op::Open if slots.len() < SLOTS => slots.push(relay.open()),
            Op::Open => {}
            Op::Close { slot } => {
                if let Some(id) = pick(&slots, slot) {
                    relay.close(id);
                    slots.retain(|&s| s != id);
                }
            }
            Op::Line { slot, line } => {
                if let Some(id) = pick(&slots, slot) {
                    relay.submit_line(id, &line);
                }
            }
            Op::Bytes { slot, data } => {
                if let Some(id) = pick(&slots, slot) {
                    if relay.submit(id, &data).is_err() {
                        relay.close(id);
                        slots.retain(|&s| s != id);
                    }
                }
            }
            Op::Drain { slot } => {
                if let Some(id) = pick(&slots, slot) {
                    let _ = relay.take_outbound(id);
                }
            }
        }
    }

    assert_eq!(relay.connection_count(), slots.len());
    for name in relay.channel_names() {
        let members = relay.members(name);
        assert!(!members.is_empty(), "empty channel {name} listed");
        for id in members {
            let joined = relay.joined(id).expect("member is open");
            assert!(joined.contains(name));
            assert!(relay.nick_of(id).is_some(), "member without nick");
        }
    }
    for id in relay.connection_ids() {
        if let Some(nick) = relay.nick_of(id) {
            assert_eq!(relay.holder_of(nick), Some(id));
        }
        for channel in relay.joined(id).expect("open") {
            assert!(relay.members(channel).contains(&id));
        }
    }
});
