//! Fuzz target for the token decoder.
//!
//! Arbitrary bytes must either decode into tokens or return
//! `TokenInvalidEncoding` — never panic, never over-read.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sedframe_proto::token;

fuzz_target!(|data: &[u8]| {
    let _ = token::decode(data);
});
