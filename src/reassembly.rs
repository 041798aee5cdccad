//! Receive-side reassembly for a single inbound transaction.

use std::collections::BTreeMap;

use tokio::sync::Mutex;

use crate::segment::Segment;

/// Collects out-of-order segments for one inbound transaction, streaming in-order
/// bytes eagerly so only the out-of-order tail needs to be flushed on completion.
///
/// A fresh `MsgRecv` is installed for every new transaction; once `completed` is
/// set, the owning slot must be replaced with a new instance rather than reused
/// (`transID`s get reused across independent messages over the lifetime of a
/// connection).
pub struct MsgRecv {
    inner: Mutex<Inner>,
}

struct Inner {
    read_buf: Vec<u8>,
    need_length: u32,
    read_length: u32,
    saved: BTreeMap<u16, Vec<u8>>,
    next_id: u16,
    largest_order_id: u16,
    completed: bool,
}

impl Default for MsgRecv {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgRecv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                read_buf: Vec::new(),
                need_length: 0,
                read_length: 0,
                saved: BTreeMap::new(),
                next_id: 0,
                largest_order_id: 0,
                completed: false,
            }),
        }
    }

    /// Saves one segment. Returns the completed message the first time enough
    /// bytes have arrived to satisfy `needLength`; returns `None` on a duplicate,
    /// a gap-filling segment that doesn't yet complete the message, or a segment
    /// arriving after the message was already completed (the caller is responsible
    /// for installing a fresh `MsgRecv` in that case).
    pub async fn save(&self, seg: &Segment) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().await;

        if inner.completed {
            return None;
        }

        if seg.order_id < inner.next_id || inner.saved.contains_key(&seg.order_id) {
            tracing::debug!(order_id = seg.order_id, "dropping duplicate segment");
            return None;
        }

        inner.read_length += seg.body.len() as u32;
        inner.largest_order_id = inner.largest_order_id.max(seg.order_id);

        if seg.order_id == inner.next_id {
            Self::append_in_order(&mut inner, seg.order_id, seg.body.clone());
            Self::drain_contiguous(&mut inner);
        } else {
            inner.saved.insert(seg.order_id, seg.body.clone());
        }

        if inner.need_length > 0 && inner.read_length >= inner.need_length {
            inner.completed = true;

            // Flush whatever out-of-order tail is still held, ascending by order id.
            let tail: Vec<u16> = inner.saved.keys().copied().collect();
            for id in tail {
                if let Some(body) = inner.saved.remove(&id) {
                    inner.read_buf.extend_from_slice(&body);
                }
            }

            return Some(inner.read_buf.clone());
        }

        None
    }

    fn append_in_order(inner: &mut Inner, order_id: u16, body: Vec<u8>) {
        if order_id == 0 {
            if body.len() >= 4 {
                inner.need_length = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                inner.read_buf.extend_from_slice(&body[4..]);
            } else {
                inner.read_buf.extend_from_slice(&body);
            }
        } else {
            inner.read_buf.extend_from_slice(&body);
        }

        inner.next_id = inner.next_id.wrapping_add(1);
    }

    fn drain_contiguous(inner: &mut Inner) {
        while let Some(body) = inner.saved.remove(&inner.next_id) {
            inner.read_buf.extend_from_slice(&body);
            inner.next_id = inner.next_id.wrapping_add(1);
        }
    }

    /// Returns `(largestOrderID, missing)`, the highest order id ever observed and
    /// the sorted list of order ids in `[nextID, largestOrderID)` not yet saved.
    /// Returns `(0, [])` once the message is completed.
    pub async fn missing(&self) -> (u16, Vec<u16>) {
        let inner = self.inner.lock().await;

        if inner.completed {
            return (0, Vec::new());
        }

        let missing = (inner.next_id..inner.largest_order_id).filter(|id| !inner.saved.contains_key(id)).collect();

        (inner.largest_order_id, missing)
    }

    pub async fn is_completed(&self) -> bool {
        self.inner.lock().await.completed
    }
}
