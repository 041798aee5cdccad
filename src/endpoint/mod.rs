//! The two connection-multiplexer endpoints: [`Server`] accepts inbound
//! handshakes over one shared socket, [`Client`] drives one outbound connection
//! and keeps it alive with periodic pings.

mod client;
mod server;

pub use client::Client;
pub use server::Server;
