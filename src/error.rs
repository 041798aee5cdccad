//! The crate-wide error type.

use std::io;

/// Everything that can go wrong while decoding a segment, running the
/// reliability engine, or driving a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A blocking operation (message send, RPC, ping) exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The connection was closed while a caller was waiting on it.
    #[error("connection was shut down")]
    ConnectionShutdown,

    /// A decoded segment carried a `type` byte this crate doesn't recognize.
    #[error("unknown segment type {0}")]
    UnknownSegmentType(u8),

    /// A decoded segment's checksum did not match the one recomputed on receipt.
    #[error("segment checksum mismatch")]
    SegmentChecksumMismatch,

    /// A datagram was shorter than a segment header.
    #[error("segment truncated: {0} bytes is shorter than the header")]
    SegmentTruncated(usize),

    /// An encode was attempted with a body larger than `BODY_MAX`.
    #[error("segment body of {len} bytes exceeds the {max} byte limit")]
    SegmentBodyTooLarge { len: usize, max: usize },

    /// A `transID` fell outside `[0, T)`.
    #[error("transaction id {0} is out of range")]
    TransIdOutOfRange(u16),

    /// `ConnectionPool::insert` was called for an address already present.
    #[error("a connection for {0} already exists")]
    ClientAlreadyExists(std::net::SocketAddr),

    /// `sendMsg` could not reserve a send slot before the attempt budget ran out.
    #[error("no free outbound transaction slot")]
    SendingListFull,

    /// No free inbound transaction slot was available for a fresh transaction.
    #[error("no free inbound transaction slot")]
    RecvingListFull,

    /// A `Req` segment carried a request subtype this crate doesn't recognize.
    #[error("unknown request subtype {0}")]
    UnknownRequestType(u8),

    /// An empty message was passed to `send_msg`.
    #[error("message must not be empty")]
    EmptyMessage,

    /// The underlying socket failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T = (), E = TransportError> = std::result::Result<T, E>;
