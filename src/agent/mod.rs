//! Device-agent protocol: wire codec and correlated connection handling

pub mod codec;
pub mod connection;

pub use connection::{ActionCode, ConnectionEvent, ConnectionId, ConnectionManager};
