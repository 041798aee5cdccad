//! Per-peer connection state: transaction slots, RPC correlation tables, the
//! retransmit loop, ping, and the inbound message queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::constants::*;
use crate::error::{Result, TransportError};
use crate::outgoing::MsgSend;
use crate::reassembly::MsgRecv;
use crate::request::{self, QueryReceiveStatus};
use crate::segment::{self, Segment, SegmentType};
use crate::shutdown::Shutdown;
use crate::FxDashMap;

/// State for one peer: reachable at `remote_addr` over a shared socket, identified
/// by the `streamID` carried on the handshake segment that created it.
pub struct Conn {
    remote_addr: SocketAddr,
    stream_id: u32,
    socket: Arc<UdpSocket>,

    recv_slots: Vec<AsyncMutex<Option<Arc<MsgRecv>>>>,
    send_slots: Vec<StdMutex<Option<Arc<MsgSend>>>>,

    /// `transID -> completion sender`, fired when a `Received` segment arrives.
    send_wait: FxDashMap<u16, oneshot::Sender<()>>,
    /// `requestID -> response sender`, fired when the matching `Rep` arrives.
    requests: FxDashMap<u32, oneshot::Sender<Vec<u8>>>,
    /// `pingID -> completion sender`, fired when the matching `PingRep` arrives.
    pings: FxDashMap<u32, oneshot::Sender<()>>,

    next_request_id: AtomicU32,
    next_ping_id: AtomicU32,

    last_active: StdMutex<Instant>,
    shutdown: Shutdown,

    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Releases exactly the send slot it was constructed for, regardless of how
/// `send_msg` exits. Captures the claimed index by value so a closure over a
/// loop variable can never release the wrong slot.
struct SlotGuard<'a> {
    slots: &'a [StdMutex<Option<Arc<MsgSend>>>],
    idx: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slots[self.idx].lock().unwrap() = None;
    }
}

impl Conn {
    pub(crate) fn new(socket: Arc<UdpSocket>, remote_addr: SocketAddr, stream_id: u32) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            remote_addr,
            stream_id,
            socket,
            recv_slots: (0..CONN_TRAN_SIZE).map(|_| AsyncMutex::new(None)).collect(),
            send_slots: (0..CONN_TRAN_SIZE).map(|_| StdMutex::new(None)).collect(),
            send_wait: FxDashMap::default(),
            requests: FxDashMap::default(),
            pings: FxDashMap::default(),
            // Randomized start, not 0: matches elvis-core's TCP session opening
            // with a random initial sequence number rather than a fixed one.
            next_request_id: AtomicU32::new(rand::random()),
            next_ping_id: AtomicU32::new(rand::random()),
            last_active: StdMutex::new(Instant::now()),
            shutdown: Shutdown::new(),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Fires the connection's shutdown signal. Does not remove the connection
    /// from any pool; the owning endpoint is responsible for that (a `Conn`
    /// holds no back-reference to its pool).
    pub fn close(&self) {
        self.shutdown.shut_down();
    }

    pub fn is_idle_since(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(*self.last_active.lock().unwrap()) > timeout
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    async fn send_segment(&self, ty: SegmentType, trans_id: u16, order_id: u16, body: &[u8]) -> Result<()> {
        let wire = segment::encode(ty, 0, self.stream_id, trans_id, order_id, body, BODY_MAX)?;
        self.socket.send_to(&wire, self.remote_addr).await?;
        Ok(())
    }

    // ---- inbound dispatch (spec §4.4) ----------------------------------------

    /// Decodes and dispatches one inbound datagram. Decode failures and dispatch
    /// errors are logged and swallowed: a malformed datagram must not take down
    /// the connection.
    pub async fn handle(&self, bytes: &[u8]) {
        self.touch();

        let seg = match segment::decode(bytes) {
            Ok(seg) => seg,
            Err(err) => {
                tracing::warn!(%err, from = %self.remote_addr, "dropping malformed datagram");
                return;
            }
        };

        let result = match seg.ty {
            SegmentType::Syn => self.handle_syn(seg).await,
            SegmentType::Ack => {
                tracing::debug!(from = %self.remote_addr, "ignoring stray ACK on an established connection");
                Ok(())
            }
            SegmentType::PingReq => self.handle_ping_req(seg).await,
            SegmentType::PingRep => self.handle_ping_rep(seg).await,
            SegmentType::Req => self.handle_req(seg).await,
            SegmentType::Rep => self.handle_rep(seg).await,
            SegmentType::Received => self.handle_received(seg).await,
            SegmentType::Trans => self.handle_trans(seg).await,
            SegmentType::ReTrans => Ok(()),
        };

        if let Err(err) = result {
            tracing::warn!(%err, from = %self.remote_addr, "error handling segment");
        }
    }

    async fn handle_syn(&self, seg: Segment) -> Result<()> {
        self.send_segment(SegmentType::Ack, 0, 0, &seg.body).await
    }

    async fn handle_ping_req(&self, seg: Segment) -> Result<()> {
        self.send_segment(SegmentType::PingRep, 0, 0, &seg.body).await
    }

    async fn handle_ping_rep(&self, seg: Segment) -> Result<()> {
        if seg.body.len() < 4 {
            return Err(TransportError::SegmentTruncated(seg.body.len()));
        }

        let ping_id = u32::from_be_bytes([seg.body[0], seg.body[1], seg.body[2], seg.body[3]]);

        if let Some((_, tx)) = self.pings.remove(&ping_id) {
            let _ = tx.send(());
        }

        Ok(())
    }

    async fn handle_req(&self, seg: Segment) -> Result<()> {
        let (request_id, subtype) = request::decode_request(&seg.body)?;

        match subtype {
            Ok(trans_id) => self.handle_query_receive(request_id, trans_id).await,
            Err(unknown) => {
                tracing::warn!(unknown_subtype = unknown, "unknown request subtype");
                let body = request::encode_query_receive_response(request_id, &QueryReceiveStatus::UnknownType);
                self.send_segment(SegmentType::Rep, seg.trans_id, 0, &body).await?;
                Err(TransportError::UnknownRequestType(unknown))
            }
        }
    }

    async fn handle_query_receive(&self, request_id: u32, trans_id: u16) -> Result<()> {
        let status = match self.recv_slots.get(trans_id as usize) {
            None => QueryReceiveStatus::NotExist,
            Some(slot_mutex) => {
                let slot = slot_mutex.lock().await;
                match slot.as_ref() {
                    None => QueryReceiveStatus::NotExist,
                    Some(recv) => {
                        if recv.is_completed().await {
                            QueryReceiveStatus::Completed
                        } else {
                            let (largest_order_id, missing) = recv.missing().await;
                            QueryReceiveStatus::NotCompleted { largest_order_id, missing }
                        }
                    }
                }
            }
        };

        let body = request::encode_query_receive_response(request_id, &status);
        self.send_segment(SegmentType::Rep, trans_id, 0, &body).await
    }

    async fn handle_rep(&self, seg: Segment) -> Result<()> {
        if seg.body.len() < 4 {
            return Err(TransportError::SegmentTruncated(seg.body.len()));
        }

        let request_id = u32::from_be_bytes([seg.body[0], seg.body[1], seg.body[2], seg.body[3]]);

        if let Some((_, tx)) = self.requests.remove(&request_id) {
            let _ = tx.send(seg.body);
        }

        Ok(())
    }

    async fn handle_received(&self, seg: Segment) -> Result<()> {
        if let Some((_, tx)) = self.send_wait.remove(&seg.trans_id) {
            let _ = tx.send(());
        }

        Ok(())
    }

    async fn handle_trans(&self, seg: Segment) -> Result<()> {
        let idx = seg.trans_id as usize;
        let slot_mutex = self.recv_slots.get(idx).ok_or(TransportError::TransIdOutOfRange(seg.trans_id))?;

        let recv = {
            let mut slot = slot_mutex.lock().await;

            let needs_fresh = match slot.as_ref() {
                None => true,
                Some(existing) => existing.is_completed().await,
            };

            if needs_fresh {
                *slot = Some(Arc::new(MsgRecv::new()));
            }

            slot.as_ref().expect("just installed if absent").clone()
        };

        if let Some(message) = recv.save(&seg).await {
            let _ = self.inbound_tx.send(message);
            self.send_segment(SegmentType::Received, seg.trans_id, 0, &[]).await?;
        }

        Ok(())
    }

    // ---- recvMsg --------------------------------------------------------------

    /// Blocks until a completed message is available, or the connection shuts down.
    pub async fn recv_msg(&self) -> Result<Vec<u8>> {
        let mut rx = self.inbound_rx.lock().await;

        tokio::select! {
            msg = rx.recv() => msg.ok_or(TransportError::ConnectionShutdown),
            _ = self.shutdown.wait() => Err(TransportError::ConnectionShutdown),
        }
    }

    /// As [`recv_msg`](Self::recv_msg), but bounded by `timeout`.
    pub async fn recv_msg_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.recv_msg()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    // ---- ping -------------------------------------------------------------------

    /// Sends a `PingReq` and waits for the matching `PingRep`, returning the
    /// observed round-trip time.
    pub async fn ping(&self) -> Result<Duration> {
        let ping_id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.insert(ping_id, tx);

        let start = Instant::now();

        if let Err(err) = self.send_segment(SegmentType::PingReq, 0, 0, &ping_id.to_be_bytes()).await {
            self.pings.remove(&ping_id);
            return Err(err);
        }

        tokio::select! {
            res = rx => {
                self.pings.remove(&ping_id);
                res.map(|()| start.elapsed()).map_err(|_| TransportError::ConnectionShutdown)
            }
            _ = tokio::time::sleep(PING_TIMEOUT) => {
                self.pings.remove(&ping_id);
                Err(TransportError::Timeout)
            }
            _ = self.shutdown.wait() => {
                self.pings.remove(&ping_id);
                Err(TransportError::ConnectionShutdown)
            }
        }
    }

    // ---- queryReceive RPC (spec §4.6) -------------------------------------------

    async fn query_receive(&self, trans_id: u16) -> Result<QueryReceiveStatus> {
        let deadline = Instant::now() + QUERY_OVERALL_TIMEOUT;

        for _attempt in 0..MAX_QUERY_ATTEMPTS {
            if self.shutdown.is_shut_down() {
                return Err(TransportError::ConnectionShutdown);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.requests.insert(request_id, tx);

            let body = request::encode_query_receive_request(request_id, trans_id);
            if let Err(err) = self.send_segment(SegmentType::Req, trans_id, 0, &body).await {
                self.requests.remove(&request_id);
                return Err(err);
            }

            let per_attempt = QUERY_ATTEMPT_TIMEOUT.min(remaining);

            tokio::select! {
                res = rx => {
                    self.requests.remove(&request_id);
                    match res {
                        Ok(body) => {
                            let (_, status) = request::decode_query_receive_response(&body)?;
                            return Ok(status);
                        }
                        Err(_) => continue,
                    }
                }
                _ = tokio::time::sleep(per_attempt) => {
                    self.requests.remove(&request_id);
                    continue;
                }
                _ = self.shutdown.wait() => {
                    self.requests.remove(&request_id);
                    return Err(TransportError::ConnectionShutdown);
                }
            }
        }

        Err(TransportError::Timeout)
    }

    // ---- sendMsg (spec §4.5) ---------------------------------------------------

    async fn acquire_send_slot(&self, message: &[u8]) -> Result<(u16, SlotGuard<'_>, Arc<MsgSend>)> {
        loop {
            for idx in 0..self.send_slots.len() {
                let mut slot = self.send_slots[idx].lock().unwrap();
                if slot.is_none() {
                    let msg = Arc::new(MsgSend::new(self.stream_id, idx as u16, message, BODY_MAX));
                    *slot = Some(msg.clone());
                    drop(slot);
                    return Ok((idx as u16, SlotGuard { slots: &self.send_slots, idx }, msg));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(SLOT_POLL_INTERVAL) => {}
                _ = self.shutdown.wait() => return Err(TransportError::ConnectionShutdown),
            }
        }
    }

    /// Segments and reliably delivers `message` to the peer, retrying gaps the
    /// peer reports via `QueryReceive` until a `Received` segment arrives or the
    /// attempt budget is exhausted.
    pub async fn send_msg(&self, message: &[u8]) -> Result<()> {
        if message.is_empty() {
            return Err(TransportError::EmptyMessage);
        }

        let (trans_id, _guard, msg) = self.acquire_send_slot(message).await?;

        let (done_tx, mut done_rx) = oneshot::channel();
        self.send_wait.insert(trans_id, done_tx);

        let result = self.send_msg_rounds(trans_id, &msg, &mut done_rx).await;

        self.send_wait.remove(&trans_id);
        result
    }

    async fn send_msg_rounds(&self, trans_id: u16, msg: &MsgSend, done_rx: &mut oneshot::Receiver<()>) -> Result<()> {
        let total = msg.segment_count();

        for round in 1..=MAX_SEND_ATTEMPTS {
            let mut window_exhausted = false;

            if round == 1 {
                // The first round always falls through to WAIT below, even if
                // the message has more segments than the window: spec §4.5
                // only lets a *later* round's combined missing+tail budget
                // skip WAIT and go straight back to querying.
                let upto = total.min(SEND_WINDOW_SIZE as u16);
                for (order_id, body) in msg.iter_segments().take(upto as usize) {
                    self.send_segment(SegmentType::Trans, trans_id, order_id, body).await?;
                }
            } else {
                match self.query_receive(trans_id).await {
                    Ok(QueryReceiveStatus::Completed) => return Ok(()),
                    Ok(QueryReceiveStatus::UnknownType) => {
                        tracing::warn!(trans_id, "peer reported unknown request type for queryReceive");
                    }
                    Ok(status) => {
                        // NotExist is treated the same as NotCompleted with an empty missing
                        // list: retransmit everything from the start of the tail.
                        let (largest_order_id, missing) = match status {
                            QueryReceiveStatus::NotCompleted { largest_order_id, missing } => (largest_order_id, missing),
                            _ => (0, Vec::new()),
                        };

                        let mut budget = SEND_WINDOW_SIZE;

                        for order_id in missing {
                            if budget == 0 {
                                window_exhausted = true;
                                break;
                            }
                            self.send_segment(SegmentType::Trans, trans_id, order_id, msg.segment_body(order_id)).await?;
                            budget -= 1;
                        }

                        if !window_exhausted {
                            for order_id in (largest_order_id.saturating_add(1))..total {
                                if budget == 0 {
                                    window_exhausted = true;
                                    break;
                                }
                                self.send_segment(SegmentType::Trans, trans_id, order_id, msg.segment_body(order_id)).await?;
                                budget -= 1;
                            }
                        }
                    }
                    Err(TransportError::ConnectionShutdown) => return Err(TransportError::ConnectionShutdown),
                    Err(_timeout) => {
                        // Round failed to get an answer; try again next round.
                        continue;
                    }
                }
            }

            if window_exhausted {
                // Both portions share the window budget; go straight back to querying.
                continue;
            }

            tokio::select! {
                res = &mut *done_rx => {
                    if res.is_ok() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(SENDING_TIMEOUT) => {}
                _ = self.shutdown.wait() => return Err(TransportError::ConnectionShutdown),
            }
        }

        Err(TransportError::Timeout)
    }
}

impl fmt::Display for Conn {
    /// `local:remote (stream N)`, for logs and diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string());
        write!(f, "{local}:{} (stream {})", self.remote_addr, self.stream_id)
    }
}
