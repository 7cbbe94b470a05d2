#![deny(warnings)]

//! The regional gateway tier: validates delegated server tokens, keeps the
//! VNC/SOL session registry, routes calls to in-datacenter agents, and
//! multiplexes bidirectional console streams.

pub mod agents;
pub mod server;
pub mod sessions;

pub use server::{GatewayApi, GatewayIdentity};
pub use sessions::{ConsoleSession, SessionKind, SessionRegistry};
