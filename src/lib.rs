//! A reliable, message-oriented transport layered over unreliable datagrams.
//!
//! # Organization
//! - [`segment`] is the wire format: header layout, checksum, encode/decode.
//! - [`reassembly`] and [`outgoing`] are the receive- and send-side halves of
//!   the reliability engine for a single transaction.
//! - [`request`] carries the `QueryReceive` RPC used to recover from loss.
//! - [`conn`] multiplexes transactions, RPCs, and pings over one peer
//!   connection.
//! - [`pool`] tracks live connections and garbage-collects idle ones.
//! - [`endpoint`] exposes the two entry points applications use: [`Server`]
//!   accepts inbound connections, [`Client`] dials out.
//!
//! # Protocol structure
//!
//! A [`Client`] and a [`Server`] share one wire protocol: a `SYN`/`ACK`
//! handshake establishes a connection, after which either side may call
//! `send_msg`/`recv_msg` to exchange whole messages reliably, regardless of
//! how the underlying datagram transport reorders, drops, or duplicates the
//! segments those messages are split into.

use std::hash::BuildHasherDefault;

use dashmap::DashMap;

mod constants;
pub use constants::BODY_MAX;

pub mod error;

pub mod segment;

pub mod reassembly;
pub use reassembly::MsgRecv;

pub mod outgoing;
pub use outgoing::MsgSend;

pub mod request;

pub mod shutdown;
pub use shutdown::Shutdown;

pub mod conn;
pub use conn::Conn;

pub mod pool;
pub use pool::ConnectionPool;

pub mod endpoint;
pub use endpoint::{Client, Server};

pub use error::{Result, TransportError};

/// A `DashMap` keyed by a hasher tuned for the small integer/address keys this
/// crate correlates RPCs and connections by (transaction ids, request ids,
/// socket addresses), rather than the default SipHash.
pub(crate) type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
