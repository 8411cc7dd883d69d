//! Fuzz target for the decode→encode→decode identity.
//!
//! Whatever decodes must re-encode (minimally) and decode back to the same
//! token sequence.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sedframe_proto::token;

fuzz_target!(|data: &[u8]| {
    if let Ok(tokens) = token::decode(data) {
        let reencoded = token::encode(&tokens).expect("decoded tokens must re-encode");
        let decoded = token::decode(&reencoded).expect("minimal encoding must decode");
        assert_eq!(decoded, tokens);
    }
});
