//! Property-based tests for ComPacket framing.

use proptest::prelude::*;
use sedframe_proto::compacket::{self, FrameParams, SubPacketHeader};
use zerocopy::FromBytes;

fn arbitrary_params() -> impl Strategy<Value = FrameParams> {
    (any::<u16>(), any::<u32>(), any::<u32>(), any::<u32>()).prop_map(
        |(com_id, tsn, hsn, seq_number)| FrameParams { com_id, tsn, hsn, seq_number },
    )
}

proptest! {
    #[test]
    fn wrap_unwrap_round_trip(
        params in arbitrary_params(),
        payload in prop::collection::vec(any::<u8>(), 1..2048),
    ) {
        let buf = compacket::wrap(&params, &payload);
        let out = compacket::unwrap(&buf).expect("unwrap should succeed");
        prop_assert_eq!(out.payload, payload);
        prop_assert_eq!(out.tsn, params.tsn);
        prop_assert_eq!(out.hsn, params.hsn);
        prop_assert_eq!(out.outstanding_data, 0);
        prop_assert_eq!(out.min_transfer, 0);
    }

    #[test]
    fn framing_alignment(
        params in arbitrary_params(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let buf = compacket::wrap(&params, &payload);

        // The SubPacket length field holds exactly the logical payload size
        // while the physical frame is padded to a 4-byte boundary.
        let sub_off = compacket::ComPacketHeader::SIZE + compacket::PacketHeader::SIZE;
        let (sub, _) = SubPacketHeader::ref_from_prefix(&buf[sub_off..]).expect("header");
        prop_assert_eq!(sub.length() as usize, payload.len());
        prop_assert_eq!(buf.len() % 4, 0);
    }

    #[test]
    fn unwrap_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = compacket::unwrap(&bytes);
    }

    #[test]
    fn truncated_frames_error(
        params in arbitrary_params(),
        payload in prop::collection::vec(any::<u8>(), 4..128),
    ) {
        let buf = compacket::wrap(&params, &payload);
        // Any strict prefix that still contains a ComPacket header must fail
        // rather than return partial data.
        let cut = compacket::ComPacketHeader::SIZE + payload.len() / 2;
        prop_assert!(compacket::unwrap(&buf[..cut]).is_err());
    }
}
