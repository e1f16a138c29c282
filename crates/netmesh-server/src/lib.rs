//! The netmesh chat server: connection lifecycle and message dispatch.
//!
//! One read task and one write task per connection, a dashmap registry of
//! authenticated peers, and a decrypt-verify-persist-reencrypt pipeline for
//! every chat message. See `netmesh-proto` for the wire schema.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod server;
