//! Arbitrary bytes into the message packet decoder.
//!
//! Anything that decodes must re-encode to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use scatterlog_proto::MessagePacket;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = MessagePacket::decode(data) {
        assert_eq!(packet.to_vec(), data);
    }
});
