mod stream;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::SecondsFormat;
use futures::Stream;
use ginepro::LoadBalancedChannel;
use protos::bmc::agent::v1 as agent_protos;
use protos::bmc::agent::v1::agent_client::AgentClient;
use protos::bmc::gateway::v1 as gateway_protos;
use protos::bmc::gateway::v1::gateway_server::{Gateway, GatewayServer};
use protos::bmc::manager::v1 as manager_protos;
use protos::bmc::manager::v1::manager_client::ManagerClient;
use protos::bmc::v1::ConsoleDataChunk;
use rpc_util::auth::{get_bearer_token, validate_jwt, JWKSet, ServerContext, TokenUse};
use rpc_util::infra::GrpcConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::transport::server::Connected;
use tonic::transport::Server as TransportServer;
use tonic::{Request, Response, Status, Streaming};

use crate::agents::AgentRegistry;
use crate::sessions::{ConsoleSession, SessionKind, SessionRegistry};

/// How this gateway announces itself to the manager and to agents.
#[derive(Clone, Debug)]
pub struct GatewayIdentity {
    pub gateway_id: String,
    pub region: String,
    /// The endpoint tenants reach this gateway on, as registered upstream.
    pub public_endpoint: String,
    /// Static token authenticating this gateway to the manager.
    pub fleet_token: String,
    /// Shared token agents present when reporting endpoints, if required.
    pub agent_token: Option<String>,
}

struct GatewayInner {
    identity: GatewayIdentity,
    /// Validates server tokens minted by the manager.
    jwk_set: JWKSet,
    sessions: Arc<SessionRegistry>,
    agents: AgentRegistry,
    manager: ManagerClient<LoadBalancedChannel>,
}

/// The regional gateway: terminates tenant RPCs for power and console
/// operations, validates delegated server tokens, and routes each call to
/// the agent owning the server's datacenter.
#[derive(Clone)]
pub struct GatewayApi {
    inner: Arc<GatewayInner>,
}

impl GatewayApi {
    pub fn new(
        identity: GatewayIdentity,
        jwk_set: JWKSet,
        manager: ManagerClient<LoadBalancedChannel>,
        session_ttl: Duration,
    ) -> Self {
        GatewayApi {
            inner: Arc::new(GatewayInner {
                identity,
                jwk_set,
                sessions: SessionRegistry::new(session_ttl),
                agents: AgentRegistry::new(),
                manager,
            }),
        }
    }

    /// Register this gateway with the manager. Called at startup; reports
    /// keep the registration fresh afterwards.
    pub async fn register_upstream(&self) -> Result<(), Status> {
        let identity = &self.inner.identity;
        let mut request = Request::new(manager_protos::RegisterGatewayRequest {
            gateway_id: identity.gateway_id.clone(),
            region: identity.region.clone(),
            endpoint: identity.public_endpoint.clone(),
            datacenter_ids: self.inner.agents.datacenter_ids(),
        });
        attach_bearer(&mut request, &identity.fleet_token)?;
        self.inner
            .manager
            .clone()
            .register_gateway(request)
            .await
            .map(|_| ())
    }

    pub fn update_gauges(&self) {
        self.inner.sessions.update_gauges();
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
            .add_service(GatewayServer::new(self))
            .serve_with_incoming_shutdown(incoming, shutdown_signal)
            .await
    }

    fn check_server_token(&self, metadata: &MetadataMap) -> Result<ServerContext, Status> {
        let token = get_bearer_token(metadata)?;
        validate_jwt(&token, TokenUse::Server, &self.inner.jwk_set)
    }

    /// Validate the bearer server token and check it is bound to the server
    /// named by the request.
    fn check_op(
        &self,
        metadata: &MetadataMap,
        server_id: &str,
    ) -> Result<ServerContext, Status> {
        let context = self.check_server_token(metadata)?;
        if context.server_id != server_id {
            log::warn!(
                "server token for {} used against server {server_id}",
                context.server_id
            );
            return Err(Status::permission_denied("token not valid for this server"));
        }
        Ok(context)
    }

    fn agent_for(
        &self,
        context: &ServerContext,
    ) -> Result<AgentClient<LoadBalancedChannel>, Status> {
        self.inner
            .agents
            .client_for(&context.datacenter_id)
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "no agent registered for datacenter {}",
                    context.datacenter_id
                ))
            })
    }

    fn agent_request(context: &ServerContext) -> agent_protos::ServerRequest {
        agent_protos::ServerRequest {
            server_id: context.server_id.clone(),
            sealed_context: context.sealed_credentials.clone().into_bytes().into(),
        }
    }

    async fn power_op<F, Fut>(
        &self,
        request: Request<gateway_protos::PowerRequest>,
        method: &'static str,
        f: F,
    ) -> Result<Response<gateway_protos::PowerResponse>, Status>
    where
        F: FnOnce(AgentClient<LoadBalancedChannel>, agent_protos::ServerRequest) -> Fut,
        Fut: Future<Output = Result<Response<agent_protos::OpResponse>, Status>>,
    {
        let context = self.check_op(request.metadata(), &request.get_ref().server_id)?;
        let client = self.agent_for(&context)?;
        let response =
            agent_call(f(client, Self::agent_request(&context)), method).await?;
        let inner = response.into_inner();
        Ok(Response::new(gateway_protos::PowerResponse {
            success: inner.success,
            message: inner.message,
        }))
    }

    fn session_kind_response(session: &ConsoleSession) -> gateway_protos::SessionResponse {
        gateway_protos::SessionResponse {
            session_id: session.id.clone(),
            websocket_endpoint: session.websocket_endpoint.clone(),
            viewer_url: session.viewer_url.clone(),
            expires_at: session
                .expires_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    fn create_session(
        &self,
        request: Request<gateway_protos::CreateSessionRequest>,
        kind: SessionKind,
    ) -> Result<Response<gateway_protos::SessionResponse>, Status> {
        let context = self.check_op(request.metadata(), &request.get_ref().server_id)?;
        // The owning agent must exist before we hand out a session endpoint.
        let _ = self.agent_for(&context)?;
        let session = self.inner.sessions.create(
            kind,
            &context.server_id,
            &context.customer_id,
            &context.datacenter_id,
            &self.inner.identity.public_endpoint,
        );
        Ok(Response::new(Self::session_kind_response(&session)))
    }

    /// Strictly local session lookup. A token for another server, a session
    /// of the wrong kind, or an unknown id all look identical to the caller.
    fn get_session(
        &self,
        request: Request<gateway_protos::SessionRequest>,
        kind: SessionKind,
    ) -> Result<Response<gateway_protos::SessionResponse>, Status> {
        let context = self.check_server_token(request.metadata())?;
        let session_id = &request.get_ref().session_id;
        let session = self
            .inner
            .sessions
            .get(session_id)
            .filter(|s| s.kind == kind && s.server_id == context.server_id)
            .ok_or_else(|| Status::not_found(format!("session {session_id} not found")))?;
        Ok(Response::new(Self::session_kind_response(&session)))
    }

    fn close_session(
        &self,
        request: Request<gateway_protos::SessionRequest>,
        kind: SessionKind,
    ) -> Result<Response<gateway_protos::CloseSessionResponse>, Status> {
        let context = self.check_server_token(request.metadata())?;
        let session_id = &request.get_ref().session_id;
        let exists = self
            .inner
            .sessions
            .get(session_id)
            .filter(|s| s.kind == kind && s.server_id == context.server_id)
            .is_some();
        if !exists {
            return Err(Status::not_found(format!("session {session_id} not found")));
        }
        self.inner.sessions.close(session_id);
        Ok(Response::new(gateway_protos::CloseSessionResponse {
            closed: true,
        }))
    }
}

fn attach_bearer<T>(request: &mut Request<T>, token: &str) -> Result<(), Status> {
    let value = format!("Bearer {token}")
        .parse()
        .map_err(|_| Status::internal("fleet token is not a valid header value"))?;
    request.metadata_mut().insert("authorization", value);
    Ok(())
}

/// Wrap one call to an agent with metrics and logging of unexpected errors.
async fn agent_call<T>(
    f: impl Future<Output = Result<Response<T>, Status>>,
    method: &'static str,
) -> Result<Response<T>, Status> {
    metrics::increment_counter!(
        "bmc_gateway_agent_calls_total",
        "method" => method,
    );
    let start = Instant::now();
    let result = f.await;
    metrics::histogram!(
        "bmc_gateway_agent_call_seconds",
        start.elapsed(),
        "method" => method,
    );

    if let Err(status) = &result {
        if matches!(
            status.code(),
            tonic::Code::Internal
                | tonic::Code::Unavailable
                | tonic::Code::Unknown
                | tonic::Code::Unimplemented
        ) {
            log::error!("unexpected agent error for {method}: {status:?}");
        }
    }
    result
}

#[tonic::async_trait]
impl Gateway for GatewayApi {
    #[tracing::instrument(skip_all)]
    async fn power_on(
        &self,
        request: Request<gateway_protos::PowerRequest>,
    ) -> Result<Response<gateway_protos::PowerResponse>, Status> {
        self.power_op(request, "PowerOn", |mut client, req| async move {
            client.power_on(req).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn power_off(
        &self,
        request: Request<gateway_protos::PowerRequest>,
    ) -> Result<Response<gateway_protos::PowerResponse>, Status> {
        self.power_op(request, "PowerOff", |mut client, req| async move {
            client.power_off(req).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn power_cycle(
        &self,
        request: Request<gateway_protos::PowerRequest>,
    ) -> Result<Response<gateway_protos::PowerResponse>, Status> {
        self.power_op(request, "PowerCycle", |mut client, req| async move {
            client.power_cycle(req).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn reset(
        &self,
        request: Request<gateway_protos::PowerRequest>,
    ) -> Result<Response<gateway_protos::PowerResponse>, Status> {
        self.power_op(request, "Reset", |mut client, req| async move {
            client.reset(req).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn get_power_status(
        &self,
        request: Request<gateway_protos::PowerRequest>,
    ) -> Result<Response<gateway_protos::PowerStatusResponse>, Status> {
        let context = self.check_op(request.metadata(), &request.get_ref().server_id)?;
        let mut client = self.agent_for(&context)?;
        let req = Self::agent_request(&context);
        let response =
            agent_call(client.get_power_status(req), "GetPowerStatus").await?;
        Ok(Response::new(gateway_protos::PowerStatusResponse {
            state: response.into_inner().state,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn get_bmc_info(
        &self,
        request: Request<gateway_protos::PowerRequest>,
    ) -> Result<Response<gateway_protos::BmcInfoResponse>, Status> {
        let context = self.check_op(request.metadata(), &request.get_ref().server_id)?;
        let mut client = self.agent_for(&context)?;
        let req = Self::agent_request(&context);
        let response = agent_call(client.get_bmc_info(req), "GetBmcInfo").await?;
        Ok(Response::new(gateway_protos::BmcInfoResponse {
            info: response.into_inner().info,
        }))
    }

    async fn create_vnc_session(
        &self,
        request: Request<gateway_protos::CreateSessionRequest>,
    ) -> Result<Response<gateway_protos::SessionResponse>, Status> {
        self.create_session(request, SessionKind::Vnc)
    }

    async fn get_vnc_session(
        &self,
        request: Request<gateway_protos::SessionRequest>,
    ) -> Result<Response<gateway_protos::SessionResponse>, Status> {
        self.get_session(request, SessionKind::Vnc)
    }

    async fn close_vnc_session(
        &self,
        request: Request<gateway_protos::SessionRequest>,
    ) -> Result<Response<gateway_protos::CloseSessionResponse>, Status> {
        self.close_session(request, SessionKind::Vnc)
    }

    async fn create_sol_session(
        &self,
        request: Request<gateway_protos::CreateSessionRequest>,
    ) -> Result<Response<gateway_protos::SessionResponse>, Status> {
        self.create_session(request, SessionKind::Sol)
    }

    async fn get_sol_session(
        &self,
        request: Request<gateway_protos::SessionRequest>,
    ) -> Result<Response<gateway_protos::SessionResponse>, Status> {
        self.get_session(request, SessionKind::Sol)
    }

    async fn close_sol_session(
        &self,
        request: Request<gateway_protos::SessionRequest>,
    ) -> Result<Response<gateway_protos::CloseSessionResponse>, Status> {
        self.close_session(request, SessionKind::Sol)
    }

    type StreamConsoleDataStream = stream::ConsoleOutStream;

    #[tracing::instrument(skip_all)]
    async fn stream_console_data(
        &self,
        request: Request<Streaming<ConsoleDataChunk>>,
    ) -> Result<Response<Self::StreamConsoleDataStream>, Status> {
        stream::stream_console_data(self, request).await
    }

    #[tracing::instrument(skip_all)]
    async fn report_available_endpoints(
        &self,
        request: Request<gateway_protos::AgentReport>,
    ) -> Result<Response<gateway_protos::AgentReportAck>, Status> {
        if let Some(expected) = &self.inner.identity.agent_token {
            let token = get_bearer_token(request.metadata())?;
            if &token != expected {
                return Err(Status::unauthenticated("agent token not valid"));
            }
        }
        let report = request.into_inner();
        if report.datacenter_id.is_empty() || report.agent_endpoint.is_empty() {
            return Err(Status::invalid_argument(
                "datacenter_id and agent_endpoint are required",
            ));
        }

        self.inner
            .agents
            .register(&report.datacenter_id, &report.agent_id, &report.agent_endpoint)
            .await
            .map_err(Status::unavailable)?;

        // Forward upstream with this gateway's identity stamped on.
        let identity = &self.inner.identity;
        let mut upstream = Request::new(manager_protos::ReportAvailableEndpointsRequest {
            gateway_id: identity.gateway_id.clone(),
            region: identity.region.clone(),
            gateway_endpoint: identity.public_endpoint.clone(),
            agent_id: report.agent_id.clone(),
            agent_endpoint: report.agent_endpoint.clone(),
            datacenter_id: report.datacenter_id.clone(),
            servers: report.servers,
        });
        attach_bearer(&mut upstream, &identity.fleet_token)?;
        let response = self
            .inner
            .manager
            .clone()
            .report_available_endpoints(upstream)
            .await?;

        Ok(Response::new(gateway_protos::AgentReportAck {
            accepted: response.into_inner().accepted,
        }))
    }
}

impl GatewayApi {
    pub(crate) fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub(crate) fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }
}
