//! Send-side buffer: carves an outbound message into segments on demand.

use crate::segment::SegmentType;

/// An outbound message, immutable once constructed. `payload` is the 4-byte
/// big-endian total-length prefix (covering the prefix itself) followed by the
/// user bytes, matching what the receiver's [`MsgRecv`](crate::reassembly::MsgRecv)
/// expects in segment 0.
pub struct MsgSend {
    pub ty: SegmentType,
    pub flags: u16,
    pub stream_id: u32,
    pub trans_id: u16,
    payload: Vec<u8>,
    body_max: usize,
}

impl MsgSend {
    pub fn new(stream_id: u32, trans_id: u16, message: &[u8], body_max: usize) -> Self {
        let mut payload = Vec::with_capacity(4 + message.len());
        payload.extend_from_slice(&(message.len() as u32 + 4).to_be_bytes());
        payload.extend_from_slice(message);

        Self { ty: SegmentType::Trans, flags: 0, stream_id, trans_id, payload, body_max }
    }

    pub fn segment_count(&self) -> u16 {
        (self.payload.len().div_ceil(self.body_max)) as u16
    }

    /// Synthesizes the body for segment `order_id`. `order_id` must be `< segment_count()`.
    pub fn segment_body(&self, order_id: u16) -> &[u8] {
        let start = order_id as usize * self.body_max;
        let end = (start + self.body_max).min(self.payload.len());
        &self.payload[start..end]
    }

    /// Iterates every segment body in order, `orderID = 0..segmentCount()-1`.
    pub fn iter_segments(&self) -> impl Iterator<Item = (u16, &[u8])> {
        (0..self.segment_count()).map(|id| (id, self.segment_body(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_message_is_one_segment() {
        let msg = MsgSend::new(1, 0, &[0u8; 100], 1400);
        assert_eq!(msg.segment_count(), 1);

        let body = msg.segment_body(0);
        assert_eq!(&body[..4], &104u32.to_be_bytes());
        assert_eq!(body.len(), 104);
    }

    #[test]
    fn large_message_splits_into_expected_segment_count() {
        let msg = MsgSend::new(1, 0, &[0u8; 10_000], 1400);
        // payload = 10004 bytes / 1400 = 8 segments (ceil).
        assert_eq!(msg.segment_count(), 8);

        let total: usize = msg.iter_segments().map(|(_, b)| b.len()).sum();
        assert_eq!(total, 10_004);
    }

    #[test]
    fn segments_cover_payload_contiguously() {
        let payload = (0u8..=255).cycle().take(5000).collect::<Vec<_>>();
        let msg = MsgSend::new(1, 0, &payload, 1400);

        let mut reassembled = Vec::new();
        for (_, body) in msg.iter_segments() {
            reassembled.extend_from_slice(body);
        }

        let mut expected = (payload.len() as u32 + 4).to_be_bytes().to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(reassembled, expected);
    }
}
