mod memory;

pub use memory::MemoryRepository;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{ControlEndpoint, EndpointType, Server};
use tonic::Status;

/// An identity and billing subject. Passwords are stored as salted hashes,
/// never in the clear.
#[derive(Clone, Debug)]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub api_key: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// A regional gateway registration.
#[derive(Clone, Debug)]
pub struct RegionalGateway {
    pub id: String,
    pub region: String,
    pub endpoint: String,
    pub datacenter_ids: Vec<String>,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

/// The routing record mapping one server to its gateway. Upserted atomically
/// with the Server row it describes.
#[derive(Clone, Debug)]
pub struct ServerLocation {
    pub server_id: String,
    pub customer_id: String,
    pub datacenter_id: String,
    pub regional_gateway_id: String,
    pub control_endpoints: Vec<ControlEndpoint>,
    pub primary_protocol: EndpointType,
    pub features: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepositoryError {
    /// A uniqueness constraint was violated, e.g. an email collision.
    Conflict(String),
    Internal(String),
}

impl std::error::Error for RepositoryError {}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryError::Conflict(msg) => write!(f, "conflict: {msg}"),
            RepositoryError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<RepositoryError> for Status {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => Status::already_exists(msg),
            RepositoryError::Internal(msg) => Status::internal(msg),
        }
    }
}

/// CRUD over the manager's authoritative registry. The persistent store is
/// external to this crate; everything behind this trait is swappable.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn create_customer(&self, customer: Customer) -> Result<Customer, RepositoryError>;
    async fn customer_by_email(&self, email: &str)
        -> Result<Option<Customer>, RepositoryError>;
    async fn customer_by_id(&self, id: &str) -> Result<Option<Customer>, RepositoryError>;

    /// Upsert a server and its location in one atomic step. The location's
    /// server_id must match the server's id.
    async fn upsert_server_with_location(
        &self,
        server: Server,
        location: ServerLocation,
    ) -> Result<(), RepositoryError>;
    async fn server(&self, id: &str) -> Result<Option<Server>, RepositoryError>;
    async fn list_servers(
        &self,
        customer_id: Option<&str>,
    ) -> Result<Vec<Server>, RepositoryError>;
    async fn location(&self, server_id: &str)
        -> Result<Option<ServerLocation>, RepositoryError>;

    async fn upsert_gateway(&self, gateway: RegionalGateway) -> Result<(), RepositoryError>;
    async fn gateway(&self, id: &str) -> Result<Option<RegionalGateway>, RepositoryError>;
    async fn list_gateways(&self) -> Result<Vec<RegionalGateway>, RepositoryError>;
}
