use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use model::Server;
use parking_lot::Mutex;

use super::{Customer, RegionalGateway, Repository, RepositoryError, ServerLocation};

#[derive(Default)]
struct Inner {
    customers: HashMap<String, Customer>,
    customers_by_email: HashMap<String, String>,
    servers: HashMap<String, Server>,
    locations: HashMap<String, ServerLocation>,
    gateways: HashMap<String, RegionalGateway>,
}

/// In-memory repository. The single mutex makes the server+location upsert
/// atomic; everything is lost on restart, which is fine because agents
/// re-report on their next cycle.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_customer(&self, customer: Customer) -> Result<Customer, RepositoryError> {
        let mut inner = self.inner.lock();
        if inner.customers_by_email.contains_key(&customer.email) {
            return Err(RepositoryError::Conflict(format!(
                "customer with email {} already exists",
                customer.email
            )));
        }
        inner
            .customers_by_email
            .insert(customer.email.clone(), customer.id.clone());
        inner
            .customers
            .insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let inner = self.inner.lock();
        Ok(inner
            .customers_by_email
            .get(email)
            .and_then(|id| inner.customers.get(id))
            .cloned())
    }

    async fn customer_by_id(&self, id: &str) -> Result<Option<Customer>, RepositoryError> {
        Ok(self.inner.lock().customers.get(id).cloned())
    }

    async fn upsert_server_with_location(
        &self,
        mut server: Server,
        mut location: ServerLocation,
    ) -> Result<(), RepositoryError> {
        if server.id != location.server_id {
            return Err(RepositoryError::Internal(format!(
                "server id {} does not match location server id {}",
                server.id, location.server_id
            )));
        }
        let mut inner = self.inner.lock();
        let now = Utc::now();
        if let Some(existing) = inner.servers.get(&server.id) {
            server.created_at = existing.created_at;
            // Customer assignment is an operator action; re-reports never
            // reassign an owned server.
            if !existing.customer_id.is_empty() {
                server.customer_id = existing.customer_id.clone();
                location.customer_id = existing.customer_id.clone();
            }
        } else {
            server.created_at = Some(now);
        }
        server.updated_at = Some(now);
        if let Some(existing) = inner.locations.get(&location.server_id) {
            location.created_at = existing.created_at;
        }
        location.updated_at = now;
        inner.servers.insert(server.id.clone(), server);
        inner
            .locations
            .insert(location.server_id.clone(), location);
        Ok(())
    }

    async fn server(&self, id: &str) -> Result<Option<Server>, RepositoryError> {
        Ok(self.inner.lock().servers.get(id).cloned())
    }

    async fn list_servers(
        &self,
        customer_id: Option<&str>,
    ) -> Result<Vec<Server>, RepositoryError> {
        let inner = self.inner.lock();
        let mut servers: Vec<Server> = inner
            .servers
            .values()
            .filter(|s| customer_id.map(|c| s.customer_id == c).unwrap_or(true))
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn location(
        &self,
        server_id: &str,
    ) -> Result<Option<ServerLocation>, RepositoryError> {
        Ok(self.inner.lock().locations.get(server_id).cloned())
    }

    async fn upsert_gateway(&self, gateway: RegionalGateway) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .gateways
            .insert(gateway.id.clone(), gateway);
        Ok(())
    }

    async fn gateway(&self, id: &str) -> Result<Option<RegionalGateway>, RepositoryError> {
        Ok(self.inner.lock().gateways.get(id).cloned())
    }

    async fn list_gateways(&self) -> Result<Vec<RegionalGateway>, RepositoryError> {
        let mut gateways: Vec<RegionalGateway> =
            self.inner.lock().gateways.values().cloned().collect();
        gateways.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(gateways)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use model::{ControlEndpoint, EndpointType, Server};

    use super::super::{Customer, Repository, RepositoryError, ServerLocation};
    use super::MemoryRepository;

    fn customer(email: &str) -> Customer {
        Customer {
            id: format!("cust-{email}"),
            email: email.to_owned(),
            password_hash: "x".to_owned(),
            api_key: "k".to_owned(),
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    fn server_and_location(id: &str, customer_id: &str) -> (Server, ServerLocation) {
        let server = Server {
            id: id.to_owned(),
            customer_id: customer_id.to_owned(),
            datacenter_id: "dc-1".to_owned(),
            control_endpoints: vec![ControlEndpoint {
                endpoint: "10.0.0.1:623".to_owned(),
                endpoint_type: EndpointType::Ipmi,
                ..Default::default()
            }],
            primary_protocol: EndpointType::Ipmi,
            ..Default::default()
        };
        let location = ServerLocation {
            server_id: id.to_owned(),
            customer_id: customer_id.to_owned(),
            datacenter_id: "dc-1".to_owned(),
            regional_gateway_id: "gw-1".to_owned(),
            control_endpoints: server.control_endpoints.clone(),
            primary_protocol: EndpointType::Ipmi,
            features: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        (server, location)
    }

    #[tokio::test]
    async fn email_collision_fails_creation() {
        let repo = MemoryRepository::new();
        repo.create_customer(customer("a@example.com")).await.unwrap();
        let err = repo
            .create_customer(customer("a@example.com"))
            .await
            .expect_err("");
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_preserves_created_at_and_owner() {
        let repo = MemoryRepository::new();
        let (server, location) = server_and_location("srv-1", "cust-a");
        repo.upsert_server_with_location(server, location)
            .await
            .unwrap();
        let first = repo.server("srv-1").await.unwrap().unwrap();

        // A re-report from discovery carries no customer assignment.
        let (server, location) = server_and_location("srv-1", "");
        repo.upsert_server_with_location(server, location)
            .await
            .unwrap();
        let second = repo.server("srv-1").await.unwrap().unwrap();

        assert_eq!(second.customer_id, "cust-a");
        assert_eq!(second.created_at, first.created_at);
        let location = repo.location("srv-1").await.unwrap().unwrap();
        assert_eq!(location.customer_id, "cust-a");
    }

    #[tokio::test]
    async fn mismatched_ids_rejected() {
        let repo = MemoryRepository::new();
        let (server, mut location) = server_and_location("srv-1", "cust-a");
        location.server_id = "srv-2".to_owned();
        let err = repo
            .upsert_server_with_location(server, location)
            .await
            .expect_err("");
        assert!(matches!(err, RepositoryError::Internal(_)));
    }
}
