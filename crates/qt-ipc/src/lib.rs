//! Manager↔Trader IPC: a length-prefixed JSON protocol over Unix domain
//! sockets (TCP in tests), with request/response correlation, push streams,
//! heartbeat liveness, and exponential-backoff reconnection.

pub mod protocol;
pub mod server;
pub mod client;

pub use protocol::*;
pub use server::*;
pub use client::*;
