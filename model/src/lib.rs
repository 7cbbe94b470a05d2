#![deny(warnings)]

//! Domain types shared by the manager, gateways, agents, and the CLI client.
//! Proto messages are the wire form; these are the in-process form, with the
//! conversions between the two kept next to the types.

mod discovery;
mod endpoint;
mod server;
mod server_id;

pub use discovery::{
    DiscoveryCapabilities, DiscoveryMetadata, DiscoveryMethod, DiscoveryNetwork,
    DiscoveryProtocol, DiscoverySecurity,
};
pub use endpoint::{
    BmcCredentials, ControlEndpoint, EndpointType, PowerState, SolEndpoint, SolType, VncEndpoint,
    VncTransport,
};
pub use server::{Server, ServerStatus};
pub use server_id::generate_server_id;
