//! ComPacket → Packet → SubPacket framing.
//!
//! Every method payload travels inside three nested frames. Headers are
//! fixed-size big-endian structures parsed zero-copy; all multi-byte fields
//! are stored as raw byte arrays to avoid alignment issues.
//!
//! ```text
//! ComPacket (20 B header)
//! └── Packet (24 B header, session ids + sequence number)
//!     └── SubPacket (12 B header, payload padded to 4 B; pad not counted)
//! ```
//!
//! # Invariants
//!
//! - Every layer's length field counts only its logical payload, exclusive
//!   of its own header. SubPacket padding is counted by the *enclosing*
//!   Packet length but not by the SubPacket's own length field.
//! - [`wrap`] emits exactly one Packet with one Data SubPacket; [`unwrap`]
//!   accepts any number of both and concatenates Data payloads.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// Upper bound accepted for an inbound ComPacket, defensively below any
/// realistic negotiated TPer property.
pub const MAX_COMPACKET_SIZE: usize = 1024 * 1024;

/// Round `n` up to the next 4-byte boundary.
#[must_use]
pub fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// ComPacket header (20 bytes, big endian).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ComPacketHeader {
    reserved: [u8; 4],
    com_id: [u8; 2],
    com_id_ext: [u8; 2],
    outstanding_data: [u8; 4],
    min_transfer: [u8; 4],
    length: [u8; 4],
}

impl ComPacketHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 20;

    /// Build a header for an outbound ComPacket.
    #[must_use]
    pub fn new(com_id: u16, length: u32) -> Self {
        Self {
            reserved: [0; 4],
            com_id: com_id.to_be_bytes(),
            com_id_ext: [0; 2],
            outstanding_data: [0; 4],
            min_transfer: [0; 4],
            length: length.to_be_bytes(),
        }
    }

    /// Channel identifier.
    #[must_use]
    pub fn com_id(&self) -> u16 {
        u16::from_be_bytes(self.com_id)
    }

    /// ComID extension (always zero for static ComIDs).
    #[must_use]
    pub fn com_id_ext(&self) -> u16 {
        u16::from_be_bytes(self.com_id_ext)
    }

    /// Bytes the TPer still has queued for this ComID.
    #[must_use]
    pub fn outstanding_data(&self) -> u32 {
        u32::from_be_bytes(self.outstanding_data)
    }

    /// Minimum transfer length the TPer asks the host to offer.
    #[must_use]
    pub fn min_transfer(&self) -> u32 {
        u32::from_be_bytes(self.min_transfer)
    }

    /// Total byte length of the contained Packets.
    #[must_use]
    pub fn length(&self) -> u32 {
        u32::from_be_bytes(self.length)
    }

    /// True if the reserved field is clear, as required on both directions.
    #[must_use]
    pub fn reserved_clear(&self) -> bool {
        self.reserved == [0; 4]
    }
}

impl std::fmt::Debug for ComPacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComPacketHeader")
            .field("com_id", &format!("{:#06x}", self.com_id()))
            .field("com_id_ext", &self.com_id_ext())
            .field("outstanding_data", &self.outstanding_data())
            .field("min_transfer", &self.min_transfer())
            .field("length", &self.length())
            .finish()
    }
}

/// Packet header (24 bytes, big endian).
///
/// Carries the session pairing: TPer session number then host session
/// number. Session-manager traffic travels with both set to zero.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    tsn: [u8; 4],
    hsn: [u8; 4],
    seq_number: [u8; 4],
    reserved: [u8; 2],
    ack_type: [u8; 2],
    acknowledgement: [u8; 4],
    length: [u8; 4],
}

impl PacketHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 24;

    /// Build a header for an outbound Packet.
    #[must_use]
    pub fn new(tsn: u32, hsn: u32, seq_number: u32, length: u32) -> Self {
        Self {
            tsn: tsn.to_be_bytes(),
            hsn: hsn.to_be_bytes(),
            seq_number: seq_number.to_be_bytes(),
            reserved: [0; 2],
            ack_type: [0; 2],
            acknowledgement: [0; 4],
            length: length.to_be_bytes(),
        }
    }

    /// TPer session number.
    #[must_use]
    pub fn tsn(&self) -> u32 {
        u32::from_be_bytes(self.tsn)
    }

    /// Host session number.
    #[must_use]
    pub fn hsn(&self) -> u32 {
        u32::from_be_bytes(self.hsn)
    }

    /// Per-session sequence number.
    #[must_use]
    pub fn seq_number(&self) -> u32 {
        u32::from_be_bytes(self.seq_number)
    }

    /// Acknowledgement type field.
    #[must_use]
    pub fn ack_type(&self) -> u16 {
        u16::from_be_bytes(self.ack_type)
    }

    /// Acknowledged sequence number.
    #[must_use]
    pub fn acknowledgement(&self) -> u32 {
        u32::from_be_bytes(self.acknowledgement)
    }

    /// Byte length of the contained SubPackets, padding included.
    #[must_use]
    pub fn length(&self) -> u32 {
        u32::from_be_bytes(self.length)
    }
}

impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("tsn", &self.tsn())
            .field("hsn", &self.hsn())
            .field("seq_number", &self.seq_number())
            .field("length", &self.length())
            .finish_non_exhaustive()
    }
}

/// SubPacket header (12 bytes, big endian).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SubPacketHeader {
    reserved: [u8; 6],
    kind: [u8; 2],
    length: [u8; 4],
}

impl SubPacketHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 12;

    /// SubPacket kind carrying an encoded token stream.
    pub const KIND_DATA: u16 = 0x0000;

    /// SubPacket kind carrying flow-control credit.
    pub const KIND_CREDIT_CONTROL: u16 = 0x8001;

    /// Build a header for an outbound SubPacket.
    #[must_use]
    pub fn new(kind: u16, length: u32) -> Self {
        Self { reserved: [0; 6], kind: kind.to_be_bytes(), length: length.to_be_bytes() }
    }

    /// SubPacket kind.
    #[must_use]
    pub fn kind(&self) -> u16 {
        u16::from_be_bytes(self.kind)
    }

    /// Logical payload length, exclusive of tail padding.
    #[must_use]
    pub fn length(&self) -> u32 {
        u32::from_be_bytes(self.length)
    }
}

impl std::fmt::Debug for SubPacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubPacketHeader")
            .field("kind", &format!("{:#06x}", self.kind()))
            .field("length", &self.length())
            .finish()
    }
}

/// Identifiers stamped into an outbound frame.
///
/// The engine fills these from the owning session; session-manager calls
/// use zero for both session numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    /// Channel the frame travels on
    pub com_id: u16,
    /// TPer session number (0 before SyncSession)
    pub tsn: u32,
    /// Host session number (0 for session-manager traffic)
    pub hsn: u32,
    /// Sequence number of this Packet within the session
    pub seq_number: u32,
}

/// Result of unwrapping one inbound ComPacket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    /// Concatenated payloads of all Data SubPackets
    pub payload: Vec<u8>,
    /// Outstanding-data field from the ComPacket header
    pub outstanding_data: u32,
    /// Min-transfer field from the ComPacket header
    pub min_transfer: u32,
    /// TPer session number of the contained Packets (0 if none)
    pub tsn: u32,
    /// Host session number of the contained Packets (0 if none)
    pub hsn: u32,
}

impl Unwrapped {
    /// True when the TPer signalled more data to fetch: the Data payload is
    /// empty while outstanding-data or min-transfer is nonzero. The engine
    /// re-issues IF-RECV after a backoff in that case.
    #[must_use]
    pub fn needs_repoll(&self) -> bool {
        self.payload.is_empty() && (self.outstanding_data > 0 || self.min_transfer > 0)
    }
}

/// Wrap a token payload into one ComPacket.
///
/// Emits ComPacket(Packet(SubPacket(payload))) with the SubPacket payload
/// padded to a 4-byte boundary. The caller is responsible for any further
/// padding the transport's block granularity requires.
#[must_use]
pub fn wrap(params: &FrameParams, payload: &[u8]) -> Vec<u8> {
    let padded = pad4(payload.len());
    let packet_len = SubPacketHeader::SIZE + padded;
    let com_len = PacketHeader::SIZE + packet_len;

    let mut buf = Vec::with_capacity(ComPacketHeader::SIZE + com_len);
    buf.extend_from_slice(ComPacketHeader::new(params.com_id, com_len as u32).as_bytes());
    buf.extend_from_slice(
        PacketHeader::new(params.tsn, params.hsn, params.seq_number, packet_len as u32)
            .as_bytes(),
    );
    buf.extend_from_slice(
        SubPacketHeader::new(SubPacketHeader::KIND_DATA, payload.len() as u32).as_bytes(),
    );
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + (padded - payload.len()), 0);
    buf
}

/// Unwrap one inbound ComPacket, validating every header.
///
/// Concatenates the payloads of all Data SubPackets across all contained
/// Packets. CreditControl SubPackets are skipped.
///
/// # Errors
///
/// - [`ProtocolError::ComPacketMalformed`] on a short buffer, nonzero
///   reserved field, a length field overflowing its enclosing layer, an
///   unknown SubPacket kind, or Packets disagreeing on session numbers
/// - [`ProtocolError::ComPacketOversize`] when the ComPacket length field
///   exceeds [`MAX_COMPACKET_SIZE`]
/// - [`ProtocolError::ComPacketEmpty`] when no Data payload is present and
///   neither outstanding-data nor min-transfer indicates more to come
pub fn unwrap(buf: &[u8]) -> Result<Unwrapped> {
    let (header, rest) = ComPacketHeader::ref_from_prefix(buf)
        .map_err(|_| ProtocolError::ComPacketMalformed { reason: "short com packet header" })?;

    if !header.reserved_clear() {
        return Err(ProtocolError::ComPacketMalformed { reason: "com packet reserved not zero" });
    }

    let total = header.length() as usize;
    if total > MAX_COMPACKET_SIZE {
        return Err(ProtocolError::ComPacketOversize { size: total, max: MAX_COMPACKET_SIZE });
    }
    if total > rest.len() {
        return Err(ProtocolError::ComPacketMalformed {
            reason: "com packet length exceeds buffer",
        });
    }

    let mut payload = Vec::new();
    let mut session: Option<(u32, u32)> = None;
    let mut body = &rest[..total];

    while !body.is_empty() {
        let (packet, packet_rest) = PacketHeader::ref_from_prefix(body)
            .map_err(|_| ProtocolError::ComPacketMalformed { reason: "short packet header" })?;

        let packet_len = packet.length() as usize;
        if packet_len > packet_rest.len() {
            return Err(ProtocolError::ComPacketMalformed {
                reason: "packet length exceeds com packet",
            });
        }

        let ids = (packet.tsn(), packet.hsn());
        if *session.get_or_insert(ids) != ids {
            return Err(ProtocolError::ComPacketMalformed {
                reason: "packets disagree on session numbers",
            });
        }

        let mut sub_body = &packet_rest[..packet_len];
        while !sub_body.is_empty() {
            let (sub, sub_rest) = SubPacketHeader::ref_from_prefix(sub_body).map_err(|_| {
                ProtocolError::ComPacketMalformed { reason: "short sub packet header" }
            })?;

            let sub_len = sub.length() as usize;
            let consumed = pad4(sub_len);
            if consumed > sub_rest.len() {
                return Err(ProtocolError::ComPacketMalformed {
                    reason: "sub packet length exceeds packet",
                });
            }

            match sub.kind() {
                SubPacketHeader::KIND_DATA => payload.extend_from_slice(&sub_rest[..sub_len]),
                SubPacketHeader::KIND_CREDIT_CONTROL => {},
                _ => {
                    return Err(ProtocolError::ComPacketMalformed {
                        reason: "unknown sub packet kind",
                    });
                },
            }
            sub_body = &sub_rest[consumed..];
        }

        body = &packet_rest[packet_len..];
    }

    let (tsn, hsn) = session.unwrap_or((0, 0));
    let out = Unwrapped {
        payload,
        outstanding_data: header.outstanding_data(),
        min_transfer: header.min_transfer(),
        tsn,
        hsn,
    };

    if out.payload.is_empty() && !out.needs_repoll() {
        return Err(ProtocolError::ComPacketEmpty);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: FrameParams = FrameParams { com_id: 0x07FE, tsn: 0x1000, hsn: 7, seq_number: 1 };

    #[test]
    fn header_sizes() {
        assert_eq!(std::mem::size_of::<ComPacketHeader>(), ComPacketHeader::SIZE);
        assert_eq!(std::mem::size_of::<PacketHeader>(), PacketHeader::SIZE);
        assert_eq!(std::mem::size_of::<SubPacketHeader>(), SubPacketHeader::SIZE);
    }

    #[test]
    fn wrap_pads_to_four_bytes() {
        for len in 0..9usize {
            let payload = vec![0xEEu8; len];
            let buf = wrap(&PARAMS, &payload);
            assert_eq!(buf.len() % 4, 0, "physical size must be 4-aligned for len {len}");

            // SubPacket length field holds the unpadded length
            let sub_off = ComPacketHeader::SIZE + PacketHeader::SIZE;
            let (sub, _) = SubPacketHeader::ref_from_prefix(&buf[sub_off..]).unwrap();
            assert_eq!(sub.length() as usize, len);
        }
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let payload = b"\xF8\xA8\x00\x00\x00\x00\x00\x00\x00\x01";
        let buf = wrap(&PARAMS, payload);
        let out = unwrap(&buf).unwrap();
        assert_eq!(out.payload, payload);
        assert_eq!(out.tsn, 0x1000);
        assert_eq!(out.hsn, 7);
        assert_eq!(out.outstanding_data, 0);
        assert!(!out.needs_repoll());
    }

    #[test]
    fn unwrap_rejects_reserved_bytes() {
        let mut buf = wrap(&PARAMS, b"abcd");
        buf[0] = 0x01;
        assert_eq!(
            unwrap(&buf),
            Err(ProtocolError::ComPacketMalformed { reason: "com packet reserved not zero" })
        );
    }

    #[test]
    fn unwrap_rejects_length_overflow() {
        let mut buf = wrap(&PARAMS, b"abcd");
        // Inflate the ComPacket length field beyond the buffer
        buf[16..20].copy_from_slice(&0x0000_F000u32.to_be_bytes());
        assert!(matches!(unwrap(&buf), Err(ProtocolError::ComPacketMalformed { .. })));
    }

    #[test]
    fn unwrap_rejects_oversize() {
        let mut buf = wrap(&PARAMS, b"abcd");
        buf[16..20].copy_from_slice(&(MAX_COMPACKET_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(unwrap(&buf), Err(ProtocolError::ComPacketOversize { .. })));
    }

    #[test]
    fn empty_with_outstanding_data_asks_for_repoll() {
        let mut header = ComPacketHeader::new(0x07FE, 0);
        header.outstanding_data = 512u32.to_be_bytes();
        let out = unwrap(header.as_bytes()).unwrap();
        assert!(out.needs_repoll());
        assert_eq!(out.outstanding_data, 512);
    }

    #[test]
    fn empty_without_outstanding_data_is_an_error() {
        let header = ComPacketHeader::new(0x07FE, 0);
        assert_eq!(unwrap(header.as_bytes()), Err(ProtocolError::ComPacketEmpty));
    }

    #[test]
    fn credit_control_sub_packets_are_skipped() {
        // Hand-build: ComPacket > Packet > [CreditControl(4), Data(3 + pad)]
        let credit = [0u8; 4];
        let data = b"xyz";
        let sub1_len = SubPacketHeader::SIZE + credit.len();
        let sub2_len = SubPacketHeader::SIZE + pad4(data.len());
        let packet_len = sub1_len + sub2_len;

        let mut buf = Vec::new();
        buf.extend_from_slice(
            ComPacketHeader::new(1, (PacketHeader::SIZE + packet_len) as u32).as_bytes(),
        );
        buf.extend_from_slice(PacketHeader::new(2, 3, 1, packet_len as u32).as_bytes());
        buf.extend_from_slice(
            SubPacketHeader::new(SubPacketHeader::KIND_CREDIT_CONTROL, 4).as_bytes(),
        );
        buf.extend_from_slice(&credit);
        buf.extend_from_slice(SubPacketHeader::new(SubPacketHeader::KIND_DATA, 3).as_bytes());
        buf.extend_from_slice(data);
        buf.push(0);

        let out = unwrap(&buf).unwrap();
        assert_eq!(out.payload, data);
        assert_eq!((out.tsn, out.hsn), (2, 3));
    }
}
