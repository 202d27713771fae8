//! Arbitrary bytes into the key exchange decoder and the nonce peek.
//!
//! The peek must agree with a full decode whenever the full decode succeeds.

#![no_main]

use libfuzzer_sys::fuzz_target;
use scatterlog_proto::{KeyExchange, peek_nonce};

fuzz_target!(|data: &[u8]| {
    let peeked = peek_nonce(data);
    if let Ok(exchange) = KeyExchange::decode(data) {
        assert_eq!(peeked, Some((exchange.kind(), exchange.nonce())));
    }
});
