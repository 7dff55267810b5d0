//! A durable, priority-ordered job queue spoken to over UDP.
//!
//! The [`Broker`] owns a [`JobStore`] and answers one datagram per request;
//! the [`Client`] multiplexes many concurrent requests over a single socket.
use std::io;

pub mod broker;
pub mod client;
pub mod parser;
pub mod store;
pub mod types;

pub use broker::Broker;
pub use client::{Client, ClientError};
pub use store::{JobStore, StoreError};
pub use types::job::{Job, PutAction, QueueStats};
pub use types::protocol::Message;

/// Whether a receive error is left over from an earlier send, rather than a
/// problem with the socket itself. On some platforms an ICMP unreachable for
/// one datagram surfaces as an error on a later receive.
pub(crate) fn is_transient_recv_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}
