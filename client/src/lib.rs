#![deny(warnings)]

//! Client-side plumbing for the CLI: the orchestrator that walks the
//! token/location/gateway pipeline for every server operation, and the
//! terminal handler bridging a local TTY to a console stream.

pub mod error;
pub mod orchestrator;
pub mod session;
pub mod terminal;

pub use error::ClientError;
pub use orchestrator::{BmcClient, ConsoleConnection, PowerAction};
pub use session::{AuthSession, SessionStore};
