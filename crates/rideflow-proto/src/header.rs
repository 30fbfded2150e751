//! Frame header with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 48-byte structure serialized as raw binary
//! (Big Endian). Relays route on `trip_id` and receivers sequence on
//! `sequence` without touching the CBOR payload.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameKind, TripId, UserId,
    errors::{ProtocolError, Result},
};

/// Fixed 48-byte frame header (Big Endian network byte order)
///
/// Fields are stored as raw byte arrays so the struct has no padding and every
/// 48-byte pattern is a valid value. Validation of magic, version, and size
/// happens in [`FrameHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (8 bytes: 0-7)
    magic: [u8; 4], // 0x52444657 ("RDFW" in ASCII)
    version: u8,    // 0x01
    kind: u8,       // FrameKind
    flags: [u8; 2], // reserved, zero

    // Payload metadata (8 bytes: 8-15)
    pub(crate) payload_size: [u8; 4],
    reserved: [u8; 4],

    // Routing and ordering (32 bytes: 16-47)
    trip_id: [u8; 16],
    // trip-event: version, chat-message: sequence_number,
    // resync-request: last applied, ack: highest contiguous
    sequence: [u8; 8],
    sender_id: [u8; 8],
}

impl FrameHeader {
    /// Size of the serialized header (48 bytes)
    pub const SIZE: usize = 48;

    /// Magic number: "RDFW" in ASCII (0x52444657)
    pub const MAGIC: u32 = 0x5244_4657;

    /// Current protocol version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (64 KiB). Trip events and chat messages are tiny.
    pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024;

    /// Create a new header of the given kind with all routing fields zeroed.
    #[must_use]
    pub fn new(kind: FrameKind) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            kind: kind.to_u8(),
            flags: [0; 2],
            payload_size: [0; 4],
            reserved: [0; 4],
            trip_id: [0; 16],
            sequence: [0; 8],
            sender_id: [0; 8],
        }
    }

    /// Parse header from network bytes (zero-copy).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if buffer is shorter than 48 bytes
    /// - `ProtocolError::InvalidMagic` if magic number is wrong
    /// - `ProtocolError::UnsupportedVersion` if version is not 1
    /// - `ProtocolError::UnknownKind` if the kind byte is unrecognized
    /// - `ProtocolError::PayloadTooLarge` if payload size exceeds maximum
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        if FrameKind::from_u8(header.kind).is_none() {
            return Err(ProtocolError::UnknownKind(header.kind));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Raw kind byte.
    #[must_use]
    pub fn kind_raw(&self) -> u8 {
        self.kind
    }

    /// Frame kind. `None` if unrecognized.
    #[must_use]
    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_u8(self.kind)
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Trip this frame belongs to.
    #[must_use]
    pub fn trip_id(&self) -> TripId {
        TripId::new(u128::from_be_bytes(self.trip_id))
    }

    /// Set the trip identifier.
    pub fn set_trip_id(&mut self, trip_id: TripId) {
        self.trip_id = trip_id.get().to_be_bytes();
    }

    /// Ordering field (version, sequence number, or watermark by kind).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        u64::from_be_bytes(self.sequence)
    }

    /// Set the ordering field.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence.to_be_bytes();
    }

    /// Account that sent the frame.
    #[must_use]
    pub fn sender_id(&self) -> UserId {
        UserId::new(u64::from_be_bytes(self.sender_id))
    }

    /// Set the sending account.
    pub fn set_sender_id(&mut self, sender_id: UserId) {
        self.sender_id = sender_id.get().to_be_bytes();
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHeader")
            .field("version", &self.version())
            .field("kind", &self.kind())
            .field("payload_size", &self.payload_size())
            .field("trip_id", &self.trip_id())
            .field("sequence", &self.sequence())
            .field("sender_id", &self.sender_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_layout() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
    }

    #[test]
    fn header_fields_are_big_endian() {
        let mut header = FrameHeader::new(FrameKind::TripEvent);
        header.set_trip_id(TripId::new(0x0102));
        header.set_sequence(3);
        header.set_sender_id(UserId::new(0x0A0B));

        let bytes = header.to_bytes();
        assert_eq!(hex::encode(&bytes[0..8]), "5244465701010000");
        assert_eq!(&bytes[30..32], &[0x01, 0x02]);
        assert_eq!(bytes[39], 3);
        assert_eq!(&bytes[46..48], &[0x0A, 0x0B]);
    }

    #[test]
    fn parse_accepts_own_output() {
        let mut header = FrameHeader::new(FrameKind::Ack);
        header.set_sequence(42);

        let bytes = header.to_bytes();
        let parsed = FrameHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.kind(), Some(FrameKind::Ack));
        assert_eq!(parsed.sequence(), 42);
    }

    #[test]
    fn reject_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 10]);
        assert!(matches!(result, Err(ProtocolError::FrameTooShort { expected: 48, actual: 10 })));
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes = FrameHeader::new(FrameKind::TripEvent).to_bytes();
        bytes[0] = 0xFF;
        assert!(matches!(FrameHeader::from_bytes(&bytes), Err(ProtocolError::InvalidMagic)));
    }

    #[test]
    fn reject_unknown_version() {
        let mut bytes = FrameHeader::new(FrameKind::TripEvent).to_bytes();
        bytes[4] = 9;
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn reject_unknown_kind() {
        let mut bytes = FrameHeader::new(FrameKind::TripEvent).to_bytes();
        bytes[5] = 0x7F;
        assert!(matches!(FrameHeader::from_bytes(&bytes), Err(ProtocolError::UnknownKind(0x7F))));
    }

    #[test]
    fn reject_oversized_payload_claim() {
        let mut bytes = FrameHeader::new(FrameKind::ChatMessage).to_bytes();
        bytes[8..12].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
