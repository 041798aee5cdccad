//! Wire format for a single datagram: header fields, checksum, and body.
//!
//! ```text
//! offset  size  field
//! 0       1     type
//! 1       2     flags
//! 3       4     streamID
//! 7       2     transID
//! 9       2     orderID
//! 11      2     length
//! 13      16    checksum (BLAKE2s-256, truncated to 16 bytes, of the header with
//!                         this field zeroed, followed by the body)
//! 29      len   body
//! ```

use blake2::{Blake2s256, Digest};

use crate::error::{Result, TransportError};

pub const HEADER_LEN: usize = 29;
const CHECKSUM_OFFSET: usize = 13;
const CHECKSUM_LEN: usize = 16;

/// The one-byte segment type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    /// Client → server handshake open.
    Syn,
    /// Server → client handshake reply.
    Ack,
    PingReq,
    PingRep,
    /// Application RPC request.
    Req,
    /// Application RPC response.
    Rep,
    /// Acknowledges that a full message was reassembled.
    Received,
    /// Reserved, currently unused.
    ReTrans,
    /// One segment of a user message.
    Trans,
}

impl SegmentType {
    fn to_byte(self) -> u8 {
        match self {
            SegmentType::Syn => 0,
            SegmentType::Ack => 1,
            SegmentType::PingReq => 2,
            SegmentType::PingRep => 3,
            SegmentType::Req => 4,
            SegmentType::Rep => 5,
            SegmentType::Received => 6,
            SegmentType::ReTrans => 7,
            SegmentType::Trans => 8,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => SegmentType::Syn,
            1 => SegmentType::Ack,
            2 => SegmentType::PingReq,
            3 => SegmentType::PingRep,
            4 => SegmentType::Req,
            5 => SegmentType::Rep,
            6 => SegmentType::Received,
            7 => SegmentType::ReTrans,
            8 => SegmentType::Trans,
            _ => return None,
        })
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub ty: SegmentType,
    pub flags: u16,
    pub stream_id: u32,
    pub trans_id: u16,
    /// Only meaningful for [`SegmentType::Trans`].
    pub order_id: u16,
    pub body: Vec<u8>,
}

fn checksum(header_with_zeroed_csum: &[u8; HEADER_LEN], body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Blake2s256::new();
    hasher.update(header_with_zeroed_csum);
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Encodes one segment. Fails if `body` is longer than `body_max`.
pub fn encode(
    ty: SegmentType,
    flags: u16,
    stream_id: u32,
    trans_id: u16,
    order_id: u16,
    body: &[u8],
    body_max: usize,
) -> Result<Vec<u8>> {
    if body.len() > body_max {
        return Err(TransportError::SegmentBodyTooLarge { len: body.len(), max: body_max });
    }

    let length: u16 = body
        .len()
        .try_into()
        .map_err(|_| TransportError::SegmentBodyTooLarge { len: body.len(), max: body_max })?;

    let mut header = [0u8; HEADER_LEN];
    header[0] = ty.to_byte();
    header[1..3].copy_from_slice(&flags.to_be_bytes());
    header[3..7].copy_from_slice(&stream_id.to_be_bytes());
    header[7..9].copy_from_slice(&trans_id.to_be_bytes());
    header[9..11].copy_from_slice(&order_id.to_be_bytes());
    header[11..13].copy_from_slice(&length.to_be_bytes());
    // bytes [13..29) (checksum) are left zeroed for the hash.

    let csum = checksum(&header, body);
    header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].copy_from_slice(&csum);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decodes one segment, validating its checksum before trusting any header
/// field, including the type tag: a corrupted datagram must always be
/// reported as a checksum failure, never as some other, more specific error
/// derived from bytes that haven't been verified yet.
pub fn decode(bytes: &[u8]) -> Result<Segment> {
    if bytes.len() < HEADER_LEN {
        return Err(TransportError::SegmentTruncated(bytes.len()));
    }

    let flags = u16::from_be_bytes([bytes[1], bytes[2]]);
    let stream_id = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let trans_id = u16::from_be_bytes([bytes[7], bytes[8]]);
    let order_id = u16::from_be_bytes([bytes[9], bytes[10]]);
    let length = u16::from_be_bytes([bytes[11], bytes[12]]) as usize;

    let body_start = HEADER_LEN;
    let body_end = body_start
        .checked_add(length)
        .filter(|&end| end <= bytes.len())
        .ok_or(TransportError::SegmentTruncated(bytes.len()))?;

    let wire_checksum = &bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN];

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(0);

    let body = &bytes[body_start..body_end];
    let expected = checksum(&header, body);

    if expected != wire_checksum {
        return Err(TransportError::SegmentChecksumMismatch);
    }

    let ty_byte = bytes[0];
    let ty = SegmentType::from_byte(ty_byte).ok_or(TransportError::UnknownSegmentType(ty_byte))?;

    Ok(Segment { ty, flags, stream_id, trans_id, order_id, body: body.to_vec() })
}
