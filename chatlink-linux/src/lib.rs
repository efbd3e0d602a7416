//! Chatlink Linux host: TCP transport, per-peer workers, and the session
//! controller that relays between them.
//!
//! - [`session`] - listener/dial tasks, peer registry, relay and replay
//! - [`worker`] - one reader and one writer task per connection
//! - [`transport`] - `Transport`/`Listener` seam and the TCP implementation
//! - [`store`] - received-file directory
//! - [`config`] - TOML config and env overrides
//! - [`console`] - stdin commands and event rendering

pub mod config;
pub mod console;
pub mod session;
pub mod store;
pub mod transport;
pub mod worker;
