//! Fuzz target for ComPacket unwrapping.
//!
//! Hunts for length-arithmetic overflows and over-reads in the three-layer
//! frame walker. Invalid frames must error, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sedframe_proto::compacket;

fuzz_target!(|data: &[u8]| {
    let _ = compacket::unwrap(data);
});
