#![deny(warnings)]

//! The global authority of the control plane: tenant authentication, the
//! server/gateway registry, server-location routing, and token minting.

pub mod api;
pub mod password;
pub mod repository;
pub mod tokens;

pub use api::ManagerApi;
pub use repository::{MemoryRepository, Repository};
pub use tokens::TokenIssuer;
