//! Wire codec for the endpoint's datagram headers.
//!
//! Two framings share the leading prefix byte: bit 0 clear means a regular
//! packet carrying a payload and ack information, bit 0 set means one
//! fragment of a packet too large to send whole. All multi-byte integers are
//! little-endian.

use arbitrary::Arbitrary;
use thiserror::Error;

use crate::seq::Seq;

/// Largest possible regular packet header: prefix byte, 2-byte sequence,
/// 2-byte absolute ack, 4 ack-bits bytes.
pub const MAX_PACKET_HEADER_BYTES: usize = 9;

/// Fragment framing: prefix byte, 2-byte sequence, fragment id,
/// fragment count minus one.
pub const FRAGMENT_HEADER_BYTES: usize = 5;

/// Header of a regular (non-fragment) endpoint datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub struct PacketHeader {
    /// Sequence number of this datagram.
    pub sequence: Seq,
    /// Most recent remote sequence received by the sender.
    pub ack: Seq,
    /// Bit `i` acknowledges sequence `ack - i`.
    pub ack_bits: u32,
}

/// Failure parsing an endpoint datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Not enough bytes for the claimed header layout.
    #[error("packet too small for header")]
    TooSmall,
    /// Prefix byte does not mark the expected framing.
    #[error("unexpected prefix byte")]
    BadPrefix,
    /// Fragment claims more fragments than the endpoint allows.
    #[error("fragment count {num_fragments} over limit {max_fragments}")]
    TooManyFragments {
        /// Claimed fragment count.
        num_fragments: usize,
        /// Configured limit.
        max_fragments: usize,
    },
    /// Fragment id is not below the fragment count.
    #[error("fragment id {fragment_id} outside fragment count {num_fragments}")]
    FragmentIdOutOfRange {
        /// Claimed fragment id.
        fragment_id: usize,
        /// Claimed fragment count.
        num_fragments: usize,
    },
    /// The regular header embedded in fragment 0 disagrees with the fragment
    /// framing about the packet sequence.
    #[error("embedded header sequence mismatch")]
    SequenceMismatch,
    /// A non-final fragment's payload is not exactly the fragment size, or a
    /// payload exceeds it.
    #[error("bad fragment payload length")]
    BadFragmentSize,
}

/// Writes a regular packet header into `dest`, returning the encoded length.
///
/// The prefix byte compresses the header: bits 1..=4 flag which ack-bits
/// bytes are **not** `0xFF` (fully-acked runs are elided entirely), bit 5
/// flags that the ack is encoded as a one-byte delta below the sequence
/// rather than a two-byte absolute value.
///
/// # Panics
///
/// Panics if `dest` is shorter than [`MAX_PACKET_HEADER_BYTES`].
pub fn write_packet_header(dest: &mut [u8], header: PacketHeader) -> usize {
    assert!(dest.len() >= MAX_PACKET_HEADER_BYTES);
    let PacketHeader {
        sequence,
        ack,
        ack_bits,
    } = header;

    let mut prefix: u8 = 0;
    for i in 0..4 {
        if (ack_bits >> (i * 8)) & 0xFF != 0xFF {
            prefix |= 1 << (i + 1);
        }
    }
    let sequence_difference = sequence.0.wrapping_sub(ack.0);
    if sequence_difference <= 255 {
        prefix |= 1 << 5;
    }

    let mut at = 0;
    dest[at] = prefix;
    at += 1;
    dest[at..at + 2].copy_from_slice(&sequence.0.to_le_bytes());
    at += 2;

    if sequence_difference <= 255 {
        dest[at] = sequence_difference as u8;
        at += 1;
    } else {
        dest[at..at + 2].copy_from_slice(&ack.0.to_le_bytes());
        at += 2;
    }

    for i in 0..4 {
        let byte = ((ack_bits >> (i * 8)) & 0xFF) as u8;
        if byte != 0xFF {
            dest[at] = byte;
            at += 1;
        }
    }

    debug_assert!(at <= MAX_PACKET_HEADER_BYTES);
    at
}

/// Parses a regular packet header, returning it and its encoded length.
///
/// # Errors
///
/// Errors if the data is truncated or not a regular packet.
pub fn read_packet_header(data: &[u8]) -> Result<(PacketHeader, usize), HeaderError> {
    if data.len() < 3 {
        return Err(HeaderError::TooSmall);
    }
    let prefix = data[0];
    if prefix & 1 != 0 {
        return Err(HeaderError::BadPrefix);
    }

    let sequence = Seq(u16::from_le_bytes([data[1], data[2]]));
    let mut at = 3;

    let ack = if prefix & (1 << 5) != 0 {
        if data.len() < at + 1 {
            return Err(HeaderError::TooSmall);
        }
        let delta = data[at];
        at += 1;
        sequence.wrapping_sub(u16::from(delta))
    } else {
        if data.len() < at + 2 {
            return Err(HeaderError::TooSmall);
        }
        let ack = Seq(u16::from_le_bytes([data[at], data[at + 1]]));
        at += 2;
        ack
    };

    let mut ack_bits = 0xFFFF_FFFFu32;
    for i in 0..4u32 {
        if prefix & (1 << (i + 1)) != 0 {
            if data.len() < at + 1 {
                return Err(HeaderError::TooSmall);
            }
            ack_bits &= !(0xFF << (i * 8));
            ack_bits |= u32::from(data[at]) << (i * 8);
            at += 1;
        }
    }

    Ok((
        PacketHeader {
            sequence,
            ack,
            ack_bits,
        },
        at,
    ))
}

/// Parsed fragment framing plus where its payload starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Sequence of the fragmented packet; shared by all its fragments.
    pub sequence: Seq,
    /// Index of this fragment within the packet.
    pub fragment_id: usize,
    /// Total number of fragments in the packet.
    pub num_fragments: usize,
    /// Offset of the fragment payload within the datagram. For fragment 0
    /// this skips the embedded regular header.
    pub payload_offset: usize,
    /// Length in bytes of the embedded regular header (fragment 0 only).
    pub packet_header_bytes: usize,
}

/// Parses a fragment header and validates the fragment's shape.
///
/// Fragment 0 embeds the packet's regular header between the fragment
/// framing and the payload; it is parsed here both to validate it and to
/// learn its length.
///
/// # Errors
///
/// Errors if the framing is truncated, inconsistent, or violates the
/// endpoint's fragment limits.
pub fn read_fragment_header(
    data: &[u8],
    max_fragments: usize,
    fragment_size: usize,
) -> Result<FragmentHeader, HeaderError> {
    if data.len() < FRAGMENT_HEADER_BYTES {
        return Err(HeaderError::TooSmall);
    }
    if data[0] != 1 {
        return Err(HeaderError::BadPrefix);
    }

    let sequence = Seq(u16::from_le_bytes([data[1], data[2]]));
    let fragment_id = usize::from(data[3]);
    let num_fragments = usize::from(data[4]) + 1;

    if num_fragments > max_fragments {
        return Err(HeaderError::TooManyFragments {
            num_fragments,
            max_fragments,
        });
    }
    if fragment_id >= num_fragments {
        return Err(HeaderError::FragmentIdOutOfRange {
            fragment_id,
            num_fragments,
        });
    }

    let mut payload_offset = FRAGMENT_HEADER_BYTES;
    let mut packet_header_bytes = 0;
    if fragment_id == 0 {
        let (embedded, header_bytes) = read_packet_header(&data[FRAGMENT_HEADER_BYTES..])
            .map_err(|_| HeaderError::TooSmall)?;
        if embedded.sequence != sequence {
            return Err(HeaderError::SequenceMismatch);
        }
        packet_header_bytes = header_bytes;
        payload_offset += header_bytes;
    }

    let fragment_bytes = data.len() - payload_offset;
    if fragment_bytes > fragment_size {
        return Err(HeaderError::BadFragmentSize);
    }
    if fragment_id != num_fragments - 1 && fragment_bytes != fragment_size {
        return Err(HeaderError::BadFragmentSize);
    }

    Ok(FragmentHeader {
        sequence,
        fragment_id,
        num_fragments,
        payload_offset,
        packet_header_bytes,
    })
}
