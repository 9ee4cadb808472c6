//! Fuzz target for line parsing and framing.
//!
//! Arbitrary bytes must never panic the command parser, the reply parser or
//! the frame buffer.

#![no_main]

use chanrelay::protocol::{Command, Reply, is_valid_channel, is_valid_nick};
use chanrelay::server::FrameBuffer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match Command::from_bytes(data) {
        Command::Nick(nick) => assert!(is_valid_nick(&nick)),
        Command::Join(channel) | Command::Part(channel) => assert!(is_valid_channel(&channel)),
        Command::Message { channel, body } => {
            assert!(is_valid_channel(&channel));
            assert!(!body.contains('\n'));
        }
        Command::List | Command::Invalid(_) | Command::Unrecognized => {}
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = Reply::parse(s);
    }

    // Feed the bytes in two pieces; drained lines never carry a delimiter.
    let split = data.first().map_or(0, |&b| usize::from(b)).min(data.len());
    let mut frames = FrameBuffer::new(0);
    frames.append(&data[..split]);
    let mut lines = frames.drain_complete_messages();
    frames.append(&data[split..]);
    lines.extend(frames.drain_complete_messages());
    for line in &lines {
        assert!(!line.windows(2).any(|w| w == b"\r\n"));
    }
});
