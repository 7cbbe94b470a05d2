#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::Stream;
use model::{generate_server_id, EndpointType, Server};
use protos::bmc::manager::v1 as manager_protos;
use protos::bmc::manager::v1::manager_server::{Manager, ManagerServer};
use rpc_util::auth::{
    get_bearer_token, validate_fleet_token, validate_jwt, FleetToken, FleetTokenEntry, JWKSet,
    SessionClaims, TokenUse,
};
use rpc_util::infra::GrpcConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::metadata::MetadataMap;
use tonic::transport::server::Connected;
use tonic::transport::Server as TransportServer;
use tonic::{Request, Response, Status};

use crate::password::{hash_password, verify_password};
use crate::repository::{Customer, RegionalGateway, Repository, ServerLocation};
use crate::tokens::TokenIssuer;

struct ManagerInner {
    repository: Arc<dyn Repository>,
    issuer: TokenIssuer,
    /// Validates tokens minted by `issuer`; derived once at construction.
    jwk_set: JWKSet,
    /// Static identity tokens for gateways reporting endpoints.
    fleet_tokens: HashMap<FleetToken, FleetTokenEntry>,
}

/// The manager service: tenant auth, the server registry, and the
/// server-location router.
#[derive(Clone)]
pub struct ManagerApi {
    inner: Arc<ManagerInner>,
}

impl ManagerApi {
    pub fn new(
        repository: Arc<dyn Repository>,
        issuer: TokenIssuer,
        fleet_tokens: HashMap<FleetToken, FleetTokenEntry>,
    ) -> Self {
        let jwk_set = issuer.jwk_set();
        ManagerApi {
            inner: Arc::new(ManagerInner {
                repository,
                issuer,
                jwk_set,
                fleet_tokens,
            }),
        }
    }

    pub async fn serve_with_incoming_shutdown<I, IO, IE, F>(
        self,
        incoming: I,
        shutdown_signal: F,
        grpc_config: Option<GrpcConfig>,
    ) -> Result<(), tonic::transport::Error>
    where
        I: Stream<Item = Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
        F: Future<Output = ()>,
    {
        let mut server = TransportServer::builder();
        if let Some(c) = grpc_config.as_ref() {
            server = c.apply_to_server(server);
        }
        server
            .add_service(ManagerServer::new(self))
            .serve_with_incoming_shutdown(incoming, shutdown_signal)
            .await
    }

    /// Bootstrap a customer directly into the repository, bypassing the
    /// admin RPC. Used by binaries seeding an initial admin from config.
    pub async fn bootstrap_customer(
        &self,
        email: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<Customer, Status> {
        match self.inner.repository.customer_by_email(email).await? {
            Some(existing) => Ok(existing),
            None => Ok(self
                .inner
                .repository
                .create_customer(new_customer(email, password, is_admin))
                .await?),
        }
    }

    fn check_access(&self, metadata: &MetadataMap) -> Result<SessionClaims, Status> {
        let token = get_bearer_token(metadata)?;
        validate_jwt(&token, TokenUse::Access, &self.inner.jwk_set)
    }

    fn check_fleet(&self, metadata: &MetadataMap, gateway_id: &str) -> Result<(), Status> {
        let token = get_bearer_token(metadata)?;
        validate_fleet_token(
            FleetToken::new(token),
            gateway_id,
            &self.inner.fleet_tokens,
        )
    }

    /// Fetch a server for a caller, treating "not owned" identically to
    /// "does not exist" so lookups reveal nothing about other tenants.
    async fn owned_server(
        &self,
        claims: &SessionClaims,
        server_id: &str,
    ) -> Result<Server, Status> {
        let server = self
            .inner
            .repository
            .server(server_id)
            .await?
            .ok_or_else(|| Status::not_found(format!("server {server_id} not found")))?;
        if !claims.admin && server.customer_id != claims.customer_id {
            return Err(Status::not_found(format!("server {server_id} not found")));
        }
        Ok(server)
    }
}

fn new_customer(email: &str, password: &str, is_admin: bool) -> Customer {
    Customer {
        id: format!("cust-{}", uuid::Uuid::new_v4()),
        email: email.to_owned(),
        password_hash: hash_password(password),
        api_key: uuid::Uuid::new_v4().to_string(),
        is_admin,
        created_at: Utc::now(),
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn customer_proto(customer: &Customer) -> manager_protos::Customer {
    manager_protos::Customer {
        id: customer.id.clone(),
        email: customer.email.clone(),
        is_admin: customer.is_admin,
        created_at: rfc3339(customer.created_at),
    }
}

fn gateway_proto(gateway: &RegionalGateway) -> manager_protos::Gateway {
    manager_protos::Gateway {
        id: gateway.id.clone(),
        region: gateway.region.clone(),
        endpoint: gateway.endpoint.clone(),
        datacenter_ids: gateway.datacenter_ids.clone(),
        status: gateway.status.clone(),
        last_seen: rfc3339(gateway.last_seen),
    }
}

#[tonic::async_trait]
impl Manager for ManagerApi {
    #[tracing::instrument(skip_all)]
    async fn authenticate(
        &self,
        request: Request<manager_protos::AuthenticateRequest>,
    ) -> Result<Response<manager_protos::AuthenticateResponse>, Status> {
        let req = request.into_inner();
        let customer = self
            .inner
            .repository
            .customer_by_email(&req.email)
            .await?
            .filter(|c| verify_password(&req.password, &c.password_hash))
            .ok_or_else(|| {
                metrics::increment_counter!("bmc_manager_auth_failures_total");
                log::warn!("authentication failed for {}", req.email);
                Status::unauthenticated("invalid email or password")
            })?;

        let (access_token, expires_at) = self.inner.issuer.issue_access(&customer)?;
        let (refresh_token, _) = self.inner.issuer.issue_refresh(&customer)?;
        log::info!("authenticated {} ({})", customer.email, customer.id);
        Ok(Response::new(manager_protos::AuthenticateResponse {
            access_token,
            refresh_token,
            expires_at: rfc3339(expires_at),
            customer: Some(customer_proto(&customer)),
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn refresh_token(
        &self,
        request: Request<manager_protos::RefreshTokenRequest>,
    ) -> Result<Response<manager_protos::RefreshTokenResponse>, Status> {
        let req = request.into_inner();
        let claims: SessionClaims =
            validate_jwt(&req.refresh_token, TokenUse::Refresh, &self.inner.jwk_set)?;
        let customer = self
            .inner
            .repository
            .customer_by_id(&claims.customer_id)
            .await?
            .ok_or_else(|| Status::unauthenticated("customer no longer exists"))?;

        // Refresh only re-issues access tokens; the refresh token itself
        // remains valid until its own expiry.
        let (access_token, expires_at) = self.inner.issuer.issue_access(&customer)?;
        Ok(Response::new(manager_protos::RefreshTokenResponse {
            access_token,
            expires_at: rfc3339(expires_at),
        }))
    }

    async fn create_customer(
        &self,
        request: Request<manager_protos::CreateCustomerRequest>,
    ) -> Result<Response<manager_protos::CreateCustomerResponse>, Status> {
        let claims = self.check_access(request.metadata())?;
        if !claims.admin {
            return Err(Status::permission_denied("admin required"));
        }
        let req = request.into_inner();
        if req.email.is_empty() || !req.email.contains('@') {
            return Err(Status::invalid_argument("a valid email is required"));
        }
        if req.password.len() < 8 {
            return Err(Status::invalid_argument(
                "password must be at least 8 characters",
            ));
        }
        let customer = self
            .inner
            .repository
            .create_customer(new_customer(&req.email, &req.password, req.is_admin))
            .await?;
        log::info!("created customer {} ({})", customer.email, customer.id);
        Ok(Response::new(manager_protos::CreateCustomerResponse {
            customer: Some(customer_proto(&customer)),
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn list_servers(
        &self,
        request: Request<manager_protos::ListServersRequest>,
    ) -> Result<Response<manager_protos::ListServersResponse>, Status> {
        let claims = self.check_access(request.metadata())?;
        let filter = if claims.admin {
            None
        } else {
            Some(claims.customer_id.as_str())
        };
        let servers = self.inner.repository.list_servers(filter).await?;
        Ok(Response::new(manager_protos::ListServersResponse {
            servers: servers
                .into_iter()
                .map(|s| s.scrubbed().into())
                .collect(),
        }))
    }

    async fn get_server(
        &self,
        request: Request<manager_protos::GetServerRequest>,
    ) -> Result<Response<manager_protos::GetServerResponse>, Status> {
        let claims = self.check_access(request.metadata())?;
        let server = self.owned_server(&claims, &request.get_ref().server_id).await?;
        Ok(Response::new(manager_protos::GetServerResponse {
            server: Some(server.scrubbed().into()),
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn get_server_location(
        &self,
        request: Request<manager_protos::GetServerLocationRequest>,
    ) -> Result<Response<manager_protos::GetServerLocationResponse>, Status> {
        let claims = self.check_access(request.metadata())?;
        let server_id = &request.get_ref().server_id;
        let _server = self.owned_server(&claims, server_id).await?;
        let location = self
            .inner
            .repository
            .location(server_id)
            .await?
            .ok_or_else(|| Status::not_found(format!("no location for server {server_id}")))?;

        // A location must always point at a known gateway covering the
        // server's datacenter; anything else is registry corruption.
        let gateway = self
            .inner
            .repository
            .gateway(&location.regional_gateway_id)
            .await?
            .ok_or_else(|| {
                Status::internal(format!(
                    "location for {server_id} references unknown gateway {}",
                    location.regional_gateway_id
                ))
            })?;
        if !gateway.datacenter_ids.contains(&location.datacenter_id) {
            return Err(Status::internal(format!(
                "gateway {} does not serve datacenter {}",
                gateway.id, location.datacenter_id
            )));
        }

        Ok(Response::new(manager_protos::GetServerLocationResponse {
            gateway_id: gateway.id,
            gateway_endpoint: gateway.endpoint,
            datacenter_id: location.datacenter_id,
            primary_protocol: protos::bmc::v1::EndpointType::from(location.primary_protocol)
                as i32,
            features: location.features,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn get_server_token(
        &self,
        request: Request<manager_protos::GetServerTokenRequest>,
    ) -> Result<Response<manager_protos::GetServerTokenResponse>, Status> {
        let claims = self.check_access(request.metadata())?;
        let server = self.owned_server(&claims, &request.get_ref().server_id).await?;
        let (token, expires_at) = self
            .inner
            .issuer
            .issue_server_token(&claims.customer_id, &server)?;
        metrics::increment_counter!("bmc_manager_server_tokens_minted_total");
        Ok(Response::new(manager_protos::GetServerTokenResponse {
            token,
            expires_at: rfc3339(expires_at),
        }))
    }

    async fn register_server(
        &self,
        request: Request<manager_protos::RegisterServerRequest>,
    ) -> Result<Response<manager_protos::RegisterServerResponse>, Status> {
        let claims = self.check_access(request.metadata())?;
        let req = request.into_inner();

        let customer_id = if claims.admin && !req.customer_id.is_empty() {
            req.customer_id.clone()
        } else {
            claims.customer_id.clone()
        };
        if req.bmc_endpoint.is_empty() {
            return Err(Status::invalid_argument("bmc_endpoint is required"));
        }
        if req.datacenter_id.is_empty() {
            return Err(Status::invalid_argument("datacenter_id is required"));
        }
        let gateway = self
            .inner
            .repository
            .gateway(&req.gateway_id)
            .await?
            .ok_or_else(|| {
                Status::failed_precondition(format!("unknown gateway {}", req.gateway_id))
            })?;
        if !gateway.datacenter_ids.contains(&req.datacenter_id) {
            return Err(Status::failed_precondition(format!(
                "gateway {} does not serve datacenter {}",
                gateway.id, req.datacenter_id
            )));
        }

        let endpoint_type = EndpointType::try_from(req.bmc_type)
            .map_err(|err| Status::invalid_argument(err))?;
        let server_id = if req.server_id.is_empty() {
            generate_server_id(&req.datacenter_id, &req.bmc_endpoint)
        } else {
            req.server_id.clone()
        };
        let server = Server {
            id: server_id.clone(),
            customer_id: customer_id.clone(),
            datacenter_id: req.datacenter_id.clone(),
            control_endpoints: vec![model::ControlEndpoint {
                endpoint: req.bmc_endpoint.clone(),
                endpoint_type,
                ..Default::default()
            }],
            primary_protocol: endpoint_type,
            features: req.features.clone(),
            status: model::ServerStatus::Configured,
            ..Default::default()
        };
        let now = Utc::now();
        let location = ServerLocation {
            server_id: server_id.clone(),
            customer_id,
            datacenter_id: req.datacenter_id,
            regional_gateway_id: req.gateway_id,
            control_endpoints: server.control_endpoints.clone(),
            primary_protocol: endpoint_type,
            features: req.features,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .repository
            .upsert_server_with_location(server, location)
            .await?;

        Ok(Response::new(manager_protos::RegisterServerResponse {
            server_id,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn report_available_endpoints(
        &self,
        request: Request<manager_protos::ReportAvailableEndpointsRequest>,
    ) -> Result<Response<manager_protos::ReportAvailableEndpointsResponse>, Status> {
        self.check_fleet(request.metadata(), &request.get_ref().gateway_id)?;
        let req = request.into_inner();

        let now = Utc::now();
        let mut datacenter_ids = self
            .inner
            .repository
            .gateway(&req.gateway_id)
            .await?
            .map(|g| g.datacenter_ids)
            .unwrap_or_default();
        if !req.datacenter_id.is_empty() && !datacenter_ids.contains(&req.datacenter_id) {
            datacenter_ids.push(req.datacenter_id.clone());
        }
        self.inner
            .repository
            .upsert_gateway(RegionalGateway {
                id: req.gateway_id.clone(),
                region: req.region.clone(),
                endpoint: req.gateway_endpoint.clone(),
                datacenter_ids,
                status: "active".to_owned(),
                last_seen: now,
            })
            .await?;

        let mut accepted = 0u32;
        for server_proto in req.servers {
            let mut server = match Server::try_from(server_proto) {
                Ok(server) => server,
                Err(err) => {
                    log::warn!("rejecting reported server from {}: {err}", req.agent_id);
                    continue;
                }
            };
            if server.datacenter_id.is_empty() {
                server.datacenter_id = req.datacenter_id.clone();
            }
            let Some(endpoint) = server.primary_control_endpoint().cloned() else {
                log::warn!(
                    "rejecting reported server from {} with no control endpoints",
                    req.agent_id
                );
                continue;
            };
            server.id = generate_server_id(&server.datacenter_id, &endpoint.endpoint);

            let location = ServerLocation {
                server_id: server.id.clone(),
                customer_id: server.customer_id.clone(),
                datacenter_id: server.datacenter_id.clone(),
                regional_gateway_id: req.gateway_id.clone(),
                control_endpoints: server.control_endpoints.clone(),
                primary_protocol: server.primary_protocol,
                features: server.features.clone(),
                created_at: now,
                updated_at: now,
            };
            self.inner
                .repository
                .upsert_server_with_location(server, location)
                .await?;
            accepted += 1;
        }

        log::info!(
            "accepted {accepted} endpoint(s) from gateway {} (agent {})",
            req.gateway_id,
            req.agent_id
        );
        metrics::gauge!("bmc_manager_reported_endpoints", accepted as f64, "gateway" => req.gateway_id);
        Ok(Response::new(
            manager_protos::ReportAvailableEndpointsResponse { accepted },
        ))
    }

    async fn register_gateway(
        &self,
        request: Request<manager_protos::RegisterGatewayRequest>,
    ) -> Result<Response<manager_protos::RegisterGatewayResponse>, Status> {
        self.check_fleet(request.metadata(), &request.get_ref().gateway_id)?;
        let req = request.into_inner();
        self.inner
            .repository
            .upsert_gateway(RegionalGateway {
                id: req.gateway_id.clone(),
                region: req.region,
                endpoint: req.endpoint,
                datacenter_ids: req.datacenter_ids,
                status: "active".to_owned(),
                last_seen: Utc::now(),
            })
            .await?;
        log::info!("registered gateway {}", req.gateway_id);
        Ok(Response::new(manager_protos::RegisterGatewayResponse {}))
    }

    async fn list_gateways(
        &self,
        request: Request<manager_protos::ListGatewaysRequest>,
    ) -> Result<Response<manager_protos::ListGatewaysResponse>, Status> {
        self.check_access(request.metadata())?;
        let gateways = self.inner.repository.list_gateways().await?;
        Ok(Response::new(manager_protos::ListGatewaysResponse {
            gateways: gateways.iter().map(gateway_proto).collect(),
        }))
    }
}
