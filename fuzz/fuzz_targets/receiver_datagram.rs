//! Arbitrary datagrams through the full receive pipeline.
//!
//! Nothing unauthenticated may ever be delivered, and the only key requests
//! come from packets that framed correctly.

#![no_main]

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use libfuzzer_sys::fuzz_target;
use scatterlog_core::{CacheConfig, KeyCache, Receiver, ReceiverAction, ReceiverConfig};
use scatterlog_crypto::XChaCha20Poly1305Suite;

fuzz_target!(|datagrams: Vec<Vec<u8>>| {
    let group = SocketAddr::from((Ipv4Addr::new(239, 0, 0, 1), 7400));
    let mut receiver = Receiver::new(ReceiverConfig::default(), Arc::new(XChaCha20Poly1305Suite));
    let mut cache = KeyCache::new(CacheConfig::default());
    let now = Instant::now();

    for datagram in &datagrams {
        for action in receiver.handle_datagram(datagram, group, &mut cache, now, 1_700_000_000) {
            assert!(!matches!(action, ReceiverAction::Deliver(_)));
        }
    }
});
