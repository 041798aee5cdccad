//! Crate-wide tunables. All of these MUST agree between peers where the spec says so
//! (`BODY_MAX`, the missing-id cap derived from it); the rest are purely local policy.

use std::time::Duration;

/// Maximum segment body size. Chosen so header (29 bytes) + body stays comfortably
/// under a typical internet path MTU of 1500 bytes.
pub const BODY_MAX: usize = 1400;

/// Maximum number of missing order ids that fit in one `NotCompleted` response body.
pub const MAX_MISSING_IDS: usize = (BODY_MAX - 7) / 2;

/// Number of inbound/outbound transaction slots per connection.
pub const CONN_TRAN_SIZE: usize = 10;

/// Segments transmitted per retransmission round before falling back to a query.
pub const SEND_WINDOW_SIZE: usize = 1024;

/// How long a connection may sit idle before the pool GC reaps it.
pub const CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the pool GC loop sweeps for idle connections.
pub const GC_INTERVAL: Duration = Duration::from_secs(10);

/// How long `sendMsg` waits for a `Received` segment before starting another round.
pub const SENDING_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum number of rounds `sendMsg` will attempt before giving up.
pub const MAX_SEND_ATTEMPTS: u32 = 99;

/// Maximum number of attempts `queryReceive` will make before giving up.
pub const MAX_QUERY_ATTEMPTS: u32 = 99;

/// Per-attempt timeout for a single `queryReceive` round trip.
pub const QUERY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Overall deadline for a `queryReceive` RPC, across every attempt.
pub const QUERY_OVERALL_TIMEOUT: Duration = Duration::from_secs(12);

/// Interval at which a client connection sends a keepalive ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(6);

/// Timeout for a single ping round trip.
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval at which a client retries a failed handshake.
pub const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(6);

/// How long `sendMsg`'s slot-acquisition loop sleeps between polls of the outbound
/// transaction table.
pub const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The fixed key both peers must agree on to complete a handshake.
pub const HANDSHAKE_KEY: &[u8] = b"reliant-handshake-v1";

/// Largest single UDP datagram this crate will read or write. Matches `BODY_MAX`
/// plus the 29-byte header with headroom for future header growth.
pub const MAX_DATAGRAM_SIZE: usize = 1500;
