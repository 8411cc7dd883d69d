//! Fuzz target for the Level 0 Discovery parser.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sedframe_proto::discovery;

fuzz_target!(|data: &[u8]| {
    let _ = discovery::parse(data);
});
