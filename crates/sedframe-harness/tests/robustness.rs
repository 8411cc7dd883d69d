//! The emulated drive must reject garbage the way a real TPer would:
//! with an error, never a panic or a hang.

use std::sync::Arc;

use proptest::prelude::*;
use sedframe_core::transport::{PROTOCOL_TCG, Transport};
use sedframe_harness::FakeTper;

proptest! {
    #[test]
    fn garbage_if_send_errors_cleanly(
        payload in prop::collection::vec(any::<u8>(), 0..1024),
        com_id in any::<u16>(),
    ) {
        let tper = FakeTper::opal20();
        // Arbitrary bytes are not a valid ComPacket: expect a transport
        // error, not a panic
        prop_assert!(tper.if_send(PROTOCOL_TCG, com_id, &payload).is_err());
    }

    #[test]
    fn unsolicited_if_recv_yields_an_empty_frame(com_id in 2u16..0xFFFF) {
        let tper = FakeTper::opal20();
        let frame = tper.if_recv(PROTOCOL_TCG, com_id, 2048).unwrap();
        // Header-only ComPacket with nothing outstanding
        prop_assert_eq!(frame.len(), 20);
    }

    #[test]
    fn wrong_protocol_is_refused(protocol in 2u8..0xFF) {
        let tper = FakeTper::opal20();
        prop_assert!(tper.if_recv(protocol, 0x0001, 512).is_err());
        prop_assert!(tper.if_send(protocol, 0x0001, &[0u8; 512]).is_err());
    }
}

#[test]
fn well_formed_frame_with_no_session_is_refused() {
    use sedframe_proto::uid::{locking, method};
    use sedframe_proto::{
        compacket::{self, FrameParams},
        token::TokenWriter,
    };

    let tper = Arc::new(FakeTper::opal20());

    // A valid Get call against a session that was never opened
    let mut w = TokenWriter::new();
    w.call()
        .bytes(&locking::GLOBAL_RANGE.to_bytes())
        .bytes(&method::GET.to_bytes())
        .start_list()
        .end_list()
        .end_of_data()
        .start_list()
        .uint(0)
        .uint(0)
        .uint(0)
        .end_list();
    let payload = w.finish().unwrap();
    let params = FrameParams { com_id: 0x07FE, tsn: 42, hsn: 42, seq_number: 1 };
    let frame = compacket::wrap(&params, &payload);

    assert!(tper.if_send(PROTOCOL_TCG, 0x07FE, &frame).is_err());
}
