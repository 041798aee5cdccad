use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::conn::Conn;
use crate::constants::{HANDSHAKE_KEY, MAX_DATAGRAM_SIZE};
use crate::error::{Result, TransportError};
use crate::pool::ConnectionPool;
use crate::segment::{self, SegmentType};
use crate::shutdown::Shutdown;

/// Accepts connections from any number of peers over one bound socket.
///
/// An unsolicited `SYN` carrying the fixed handshake key creates a new
/// [`Conn`], registers it in the pool, and hands it to whichever caller is
/// blocked in [`accept`](Self::accept) next. Datagrams from an address that
/// already has a connection are routed straight to it.
pub struct Server {
    socket: Arc<UdpSocket>,
    pool: Arc<ConnectionPool>,
    accept_tx: mpsc::Sender<Arc<Conn>>,
    accept_rx: AsyncMutex<mpsc::Receiver<Arc<Conn>>>,
    shutdown: Shutdown,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let pool = ConnectionPool::new();
        let shutdown = Shutdown::new();
        let (accept_tx, accept_rx) = mpsc::channel(1);

        let server = Arc::new(Self {
            socket,
            pool,
            accept_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            shutdown,
        });

        server.clone().spawn_read_loop();
        server.pool.spawn_gc(server.shutdown.clone());

        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Blocks until a new peer completes the handshake, returning its connection.
    pub async fn accept(&self) -> Result<Arc<Conn>> {
        let mut rx = self.accept_rx.lock().await;

        tokio::select! {
            conn = rx.recv() => conn.ok_or(TransportError::ConnectionShutdown),
            _ = self.shutdown.wait() => Err(TransportError::ConnectionShutdown),
        }
    }

    /// Looks up an already-accepted connection by peer address.
    pub fn connection(&self, addr: &SocketAddr) -> Option<Arc<Conn>> {
        self.pool.get(addr)
    }

    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    pub fn close(&self) {
        self.shutdown.shut_down();
        self.pool.close_all();
    }

    fn spawn_read_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                tokio::select! {
                    res = self.socket.recv_from(&mut buf) => {
                        match res {
                            Ok((n, from)) => self.clone().dispatch(buf[..n].to_vec(), from),
                            Err(err) => tracing::warn!(%err, "server socket recv failed"),
                        }
                    }
                    _ = self.shutdown.wait() => return,
                }
            }
        });
    }

    fn dispatch(self: Arc<Self>, bytes: Vec<u8>, from: SocketAddr) {
        if let Some(conn) = self.pool.get(&from) {
            tokio::spawn(async move { conn.handle(&bytes).await });
            return;
        }

        tokio::spawn(async move { self.handle_handshake(bytes, from).await });
    }

    async fn handle_handshake(self: Arc<Self>, bytes: Vec<u8>, from: SocketAddr) {
        let seg = match segment::decode(&bytes) {
            Ok(seg) => seg,
            Err(err) => {
                tracing::debug!(%err, %from, "dropping datagram from unknown peer");
                return;
            }
        };

        if seg.ty != SegmentType::Syn || seg.body != HANDSHAKE_KEY {
            tracing::debug!(%from, "dropping non-handshake datagram from unknown peer");
            return;
        }

        // streamID is assigned by the server (spec §3), not echoed from the
        // client's SYN: the client's header field is a placeholder until it
        // adopts the id carried back in our ACK.
        let stream_id = self.pool.alloc_stream_id();
        let conn = Conn::new(self.socket.clone(), from, stream_id);

        if let Err(err) = self.pool.insert(from, conn.clone()) {
            tracing::debug!(%err, %from, "handshake race with an existing connection, ignoring");
            self.pool.release_stream_id(stream_id);
            return;
        }

        conn.handle(&bytes).await;

        if self.accept_tx.send(conn).await.is_err() {
            tracing::debug!(%from, "accept queue closed, dropping new connection announcement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::client::Client;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn accepts_a_handshaking_client() {
        let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client_task = tokio::spawn(async move { Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await });

        let accepted = server.accept().await.unwrap();
        let client = client_task.await.unwrap().unwrap();

        assert_eq!(accepted.remote_addr(), client.local_addr().unwrap());
        assert_eq!(server.connection_count(), 1);

        // The client adopts the streamID the server assigned in its ACK,
        // rather than choosing one of its own.
        assert_ne!(client.stream_id(), 0);
        assert_eq!(client.stream_id(), accepted.stream_id());
    }

    #[tokio::test]
    async fn two_concurrent_clients_get_distinct_stream_ids() {
        let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let a = Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let _accepted_a = server.accept().await.unwrap();
        let b = Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let _accepted_b = server.accept().await.unwrap();

        assert_ne!(a.stream_id(), b.stream_id());
    }

    #[tokio::test]
    async fn end_to_end_message_delivery() {
        let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let accepted = server.accept().await.unwrap();

        client.send_msg(b"ping").await.unwrap();
        assert_eq!(accepted.recv_msg().await.unwrap(), b"ping");

        accepted.send_msg(b"pong").await.unwrap();
        assert_eq!(client.recv_msg().await.unwrap(), b"pong");
    }
}
