//! Tracks live per-peer connections and garbage-collects idle ones.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;

use crate::conn::Conn;
use crate::constants::{CONN_TIMEOUT, GC_INTERVAL};
use crate::error::{Result, TransportError};
use crate::shutdown::Shutdown;
use crate::FxDashMap;

/// Allocates the `streamID` a server hands a client at handshake time:
/// monotonic, skipping any id currently assigned to a live connection.
///
/// This is the spec's "client pool" (§3 Data Model). The name describes
/// what it hands out (ids clients adopt), not which endpoint owns it: a
/// `Server` is the only side that ever allocates one.
struct StreamIdAllocator {
    next: AtomicU32,
    in_use: FxDashMap<u32, ()>,
}

impl StreamIdAllocator {
    fn new() -> Self {
        // 0 is reserved: a client's initial SYN carries it as a "not yet
        // assigned" placeholder before the handshake completes.
        Self { next: AtomicU32::new(1), in_use: FxDashMap::default() }
    }

    fn alloc(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if self.in_use.insert(id, ()).is_none() {
                return id;
            }
        }
    }

    fn release(&self, id: u32) {
        self.in_use.remove(&id);
    }
}

/// Shared connection table, keyed by peer address. An endpoint (`Server` or
/// `Client`) owns one of these and is responsible for inserting and explicitly
/// removing connections it closes; the GC loop only reaps ones that time out.
pub struct ConnectionPool {
    conns: FxDashMap<SocketAddr, Arc<Conn>>,
    stream_ids: StreamIdAllocator,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self { conns: FxDashMap::default(), stream_ids: StreamIdAllocator::new() }
    }
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Conn>> {
        self.conns.get(addr).map(|entry| entry.clone())
    }

    /// Allocates a fresh `streamID` for a connection about to be inserted.
    pub fn alloc_stream_id(&self) -> u32 {
        self.stream_ids.alloc()
    }

    /// Releases a `streamID` that was allocated but never successfully
    /// inserted (e.g. a handshake that lost a race against an existing entry).
    pub fn release_stream_id(&self, id: u32) {
        self.stream_ids.release(id);
    }

    /// Inserts a freshly created connection. Fails if one already exists for `addr`.
    pub fn insert(&self, addr: SocketAddr, conn: Arc<Conn>) -> Result<()> {
        match self.conns.entry(addr) {
            Entry::Occupied(_) => Err(TransportError::ClientAlreadyExists(addr)),
            Entry::Vacant(slot) => {
                slot.insert(conn);
                Ok(())
            }
        }
    }

    /// Removes and closes the connection for `addr`, if any, releasing its
    /// `streamID` back to the allocator.
    pub fn close(&self, addr: &SocketAddr) {
        if let Some((_, conn)) = self.conns.remove(addr) {
            self.stream_ids.release(conn.stream_id());
            conn.close();
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Closes and drains every connection currently tracked.
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            self.stream_ids.release(entry.value().stream_id());
            entry.value().close();
        }
        self.conns.clear();
    }

    /// Spawns the background sweep that closes and evicts connections idle longer
    /// than `CONN_TIMEOUT`. Runs until `shutdown` fires.
    pub fn spawn_gc(self: &Arc<Self>, shutdown: Shutdown) {
        let pool = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(GC_INTERVAL) => {}
                    _ = shutdown.wait() => return,
                }

                let now = Instant::now();
                let dead: Vec<SocketAddr> = pool
                    .conns
                    .iter()
                    .filter(|entry| entry.value().is_idle_since(now, CONN_TIMEOUT))
                    .map(|entry| *entry.key())
                    .collect();

                for addr in dead {
                    tracing::info!(%addr, "garbage collecting idle connection");
                    pool.close(&addr);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::net::UdpSocket;

    async fn dummy_conn(port: u16) -> Arc<Conn> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let remote = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Conn::new(socket, remote, 1)
    }

    #[tokio::test]
    async fn insert_get_and_close_round_trip() {
        let pool = ConnectionPool::new();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        let conn = dummy_conn(9000).await;

        pool.insert(addr, conn.clone()).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&addr).is_some());

        pool.close(&addr);
        assert!(pool.is_empty());
        assert!(conn.shutdown_signal().is_shut_down());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let pool = ConnectionPool::new();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9001));

        pool.insert(addr, dummy_conn(9001).await).unwrap();
        let err = pool.insert(addr, dummy_conn(9001).await).unwrap_err();

        assert!(matches!(err, TransportError::ClientAlreadyExists(a) if a == addr));
    }

    #[tokio::test]
    async fn stream_ids_are_never_zero_and_never_collide_while_in_use() {
        let pool = ConnectionPool::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..100 {
            let id = pool.alloc_stream_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id), "stream id {id} handed out twice while still live");
        }
    }

    #[tokio::test]
    async fn releasing_a_connection_frees_its_stream_id_for_reuse() {
        let pool = ConnectionPool::new();
        let id = pool.alloc_stream_id();

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9002));
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let conn = Conn::new(socket, addr, id);
        pool.insert(addr, conn).unwrap();

        pool.close(&addr);
        // id is back in the allocator's free set; it's legal for a later
        // alloc to hand it out again (not asserted directly since the
        // allocator is monotonic-first, but release must not panic or leak).
        assert!(pool.is_empty());
    }
}
