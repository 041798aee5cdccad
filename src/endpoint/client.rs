use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::conn::Conn;
use crate::constants::{HANDSHAKE_KEY, HANDSHAKE_RETRY_INTERVAL, MAX_DATAGRAM_SIZE, PING_INTERVAL};
use crate::error::{Result, TransportError};
use crate::segment::{self, SegmentType};
use crate::shutdown::Shutdown;

/// Drives one outbound connection: performs the handshake, then keeps the
/// connection alive with a periodic keepalive ping until closed.
pub struct Client {
    socket: Arc<UdpSocket>,
    conn: Arc<Conn>,
    shutdown: Shutdown,
}

impl Client {
    /// Binds `local`, then repeatedly sends a `SYN` to `remote` until the
    /// matching `ACK` arrives, retrying every [`HANDSHAKE_RETRY_INTERVAL`].
    /// The `streamID` used for the rest of the connection is the one the
    /// server's ACK carries, not anything chosen locally (spec §3: a
    /// `streamID` "identifies the logical connection assigned by the
    /// server").
    pub async fn connect(remote: SocketAddr, local: impl ToSocketAddrs) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let handshake_shutdown = Shutdown::new();

        let stream_id = Self::handshake(&socket, remote, &handshake_shutdown).await?;

        let conn = Conn::new(socket.clone(), remote, stream_id);
        let shutdown = conn.shutdown_signal();

        let client = Arc::new(Self { socket, conn, shutdown });
        client.clone().spawn_read_loop(remote);
        client.clone().spawn_ping_loop();

        Ok(client)
    }

    /// Returns the `streamID` adopted from the peer's `ACK`.
    async fn handshake(socket: &UdpSocket, remote: SocketAddr, shutdown: &Shutdown) -> Result<u32> {
        loop {
            if shutdown.is_shut_down() {
                return Err(TransportError::ConnectionShutdown);
            }

            // streamID 0 is a placeholder here: the server ignores it and
            // assigns the real id, carried back in the ACK's header.
            let wire = segment::encode(SegmentType::Syn, 0, 0, 0, 0, HANDSHAKE_KEY, HANDSHAKE_KEY.len())?;
            socket.send_to(&wire, remote).await?;

            let wait_for_ack = async {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let (n, from) = socket.recv_from(&mut buf).await?;
                    if from != remote {
                        continue;
                    }

                    let Ok(seg) = segment::decode(&buf[..n]) else { continue };
                    if seg.ty == SegmentType::Ack && seg.body == HANDSHAKE_KEY {
                        return Ok::<u32, TransportError>(seg.stream_id);
                    }
                }
            };

            tokio::select! {
                res = wait_for_ack => return res,
                _ = tokio::time::sleep(HANDSHAKE_RETRY_INTERVAL) => continue,
                _ = shutdown.wait() => return Err(TransportError::ConnectionShutdown),
            }
        }
    }

    fn spawn_read_loop(self: Arc<Self>, remote: SocketAddr) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                tokio::select! {
                    res = self.socket.recv_from(&mut buf) => {
                        match res {
                            Ok((n, from)) if from == remote => self.conn.handle(&buf[..n]).await,
                            Ok(_) => tracing::debug!("dropping datagram from unexpected address"),
                            Err(err) => tracing::warn!(%err, "client socket recv failed"),
                        }
                    }
                    _ = self.shutdown.wait() => return,
                }
            }
        });
    }

    fn spawn_ping_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PING_INTERVAL) => {}
                    _ = self.shutdown.wait() => return,
                }

                if let Err(err) = self.conn.ping().await {
                    tracing::warn!(%err, "keepalive ping failed");
                }
            }
        });
    }

    pub async fn send_msg(&self, message: &[u8]) -> Result<()> {
        self.conn.send_msg(message).await
    }

    pub async fn recv_msg(&self) -> Result<Vec<u8>> {
        self.conn.recv_msg().await
    }

    pub async fn recv_msg_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.conn.recv_msg_timeout(timeout).await
    }

    pub async fn ping(&self) -> Result<Duration> {
        self.conn.ping().await
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn stream_id(&self) -> u32 {
        self.conn.stream_id()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn close(&self) {
        self.shutdown.shut_down();
    }
}
