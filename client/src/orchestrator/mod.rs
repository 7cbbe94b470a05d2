
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use protos::bmc::gateway::v1 as gateway_protos;
use protos::bmc::gateway::v1::gateway_client::GatewayClient;
use protos::bmc::manager::v1 as manager_protos;
use protos::bmc::manager::v1::manager_client::ManagerClient;
use protos::bmc::v1 as common_protos;
use protos::bmc::v1::ConsoleDataChunk;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Streaming};

use crate::error::ClientError;
use crate::session::AuthSession;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerAction {
    On,
    Off,
    Cycle,
    Reset,
}

/// An open bidirectional console: frames pushed into `sender` reach the
/// server; `inbound` yields console output. The handshake frame has already
/// been sent when this is handed out.
pub struct ConsoleConnection {
    pub session_id: String,
    pub server_id: String,
    pub sender: mpsc::Sender<ConsoleDataChunk>,
    pub inbound: Streaming<ConsoleDataChunk>,
}

/// The client orchestrator: owns the manager connection, the tenant session,
/// and the per-endpoint cache of gateway clients.
pub struct BmcClient {
    manager: ManagerClient<Channel>,
    session: AuthSession,
    gateway_cache: Mutex<HashMap<String, GatewayClient<Channel>>>,
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_owned()
    } else {
        format!("http://{endpoint}")
    }
}

async fn connect_endpoint(endpoint: &str) -> Result<Channel, ClientError> {
    Endpoint::from_shared(normalize_endpoint(endpoint))
        .map_err(|err| ClientError::Config(format!("invalid endpoint {endpoint}: {err}")))?
        .connect()
        .await
        .map_err(ClientError::from)
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Attach `Authorization: Bearer <token>` to a request. Every authenticated
/// RPC in this crate is built through this function or `authed_request`;
/// there is deliberately no other way to construct an outbound request.
fn request_with_bearer<T>(message: T, token: &str) -> Result<Request<T>, ClientError> {
    let mut request = Request::new(message);
    let value = format!("Bearer {token}")
        .parse()
        .map_err(|_| ClientError::Internal("token is not a valid header value".to_owned()))?;
    request.metadata_mut().insert("authorization", value);
    Ok(request)
}

impl BmcClient {
    pub async fn connect(
        manager_endpoint: &str,
        session: AuthSession,
    ) -> Result<Self, ClientError> {
        let channel = connect_endpoint(manager_endpoint).await?;
        Ok(BmcClient {
            manager: ManagerClient::new(channel),
            session,
            gateway_cache: Mutex::default(),
        })
    }

    /// Password login; returns the session to persist.
    pub async fn login(
        manager_endpoint: &str,
        email: &str,
        password: &str,
    ) -> Result<(AuthSession, manager_protos::Customer), ClientError> {
        let mut manager = ManagerClient::new(connect_endpoint(manager_endpoint).await?);
        let response = manager
            .authenticate(Request::new(manager_protos::AuthenticateRequest {
                email: email.to_owned(),
                password: password.to_owned(),
            }))
            .await
            .map_err(ClientError::from)?
            .into_inner();

        let customer = response.customer.unwrap_or_default();
        let session = AuthSession {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            customer_id: customer.id.clone(),
            email: customer.email.clone(),
            expires_at: parse_expiry(&response.expires_at),
        };
        Ok((session, customer))
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    /// Re-issue the access token from the stored refresh token.
    pub async fn refresh(&mut self) -> Result<(), ClientError> {
        if self.session.refresh_token.is_empty() {
            return Err(ClientError::AuthMissing);
        }
        let response = self
            .manager
            .clone()
            .refresh_token(Request::new(manager_protos::RefreshTokenRequest {
                refresh_token: self.session.refresh_token.clone(),
            }))
            .await
            .map_err(ClientError::from)?
            .into_inner();
        self.session.access_token = response.access_token;
        self.session.expires_at = parse_expiry(&response.expires_at);
        Ok(())
    }

    /// The one way an access-token request gets built: local validity check
    /// first (no I/O), then the bearer header.
    fn authed_request<T>(&self, message: T) -> Result<Request<T>, ClientError> {
        self.session.ensure_valid_token()?;
        request_with_bearer(message, &self.session.access_token)
    }

    pub async fn list_servers(&mut self) -> Result<Vec<common_protos::Server>, ClientError> {
        let request = self.authed_request(manager_protos::ListServersRequest {})?;
        let response = self
            .manager
            .clone()
            .list_servers(request)
            .await
            .map_err(ClientError::from)?;
        Ok(response.into_inner().servers)
    }

    pub async fn get_server(
        &mut self,
        server_id: &str,
    ) -> Result<common_protos::Server, ClientError> {
        let request = self.authed_request(manager_protos::GetServerRequest {
            server_id: server_id.to_owned(),
        })?;
        let response = self
            .manager
            .clone()
            .get_server(request)
            .await
            .map_err(ClientError::from)?;
        response
            .into_inner()
            .server
            .ok_or_else(|| ClientError::Internal("manager returned an empty server".to_owned()))
    }

    pub async fn register_server(
        &mut self,
        request: manager_protos::RegisterServerRequest,
    ) -> Result<String, ClientError> {
        let request = self.authed_request(request)?;
        let response = self
            .manager
            .clone()
            .register_server(request)
            .await
            .map_err(ClientError::from)?;
        Ok(response.into_inner().server_id)
    }

    pub async fn list_gateways(
        &mut self,
    ) -> Result<Vec<manager_protos::Gateway>, ClientError> {
        let request = self.authed_request(manager_protos::ListGatewaysRequest {})?;
        let response = self
            .manager
            .clone()
            .list_gateways(request)
            .await
            .map_err(ClientError::from)?;
        Ok(response.into_inner().gateways)
    }

    /// The per-operation pipeline: valid access token (local), server token,
    /// location, cached gateway client.
    async fn server_op_target(
        &mut self,
        server_id: &str,
    ) -> Result<(GatewayClient<Channel>, String), ClientError> {
        let request = self.authed_request(manager_protos::GetServerTokenRequest {
            server_id: server_id.to_owned(),
        })?;
        let token = self
            .manager
            .clone()
            .get_server_token(request)
            .await
            .map_err(ClientError::from)?
            .into_inner()
            .token;

        let request = self.authed_request(manager_protos::GetServerLocationRequest {
            server_id: server_id.to_owned(),
        })?;
        let location = self
            .manager
            .clone()
            .get_server_location(request)
            .await
            .map_err(ClientError::from)?
            .into_inner();

        let gateway = self.gateway_client(&location.gateway_endpoint).await?;
        Ok((gateway, token))
    }

    /// Cache lookup keyed by the verbatim endpoint string from the manager.
    /// Two endpoint spellings are two cache entries even if they resolve to
    /// the same host.
    async fn gateway_client(
        &self,
        gateway_endpoint: &str,
    ) -> Result<GatewayClient<Channel>, ClientError> {
        if let Some(client) = self.gateway_cache.lock().get(gateway_endpoint) {
            return Ok(client.clone());
        }

        let channel = connect_endpoint(gateway_endpoint).await?;
        let client = GatewayClient::new(channel);
        // Another task may have raced us here; first insert wins so every
        // caller shares one client per endpoint.
        let mut cache = self.gateway_cache.lock();
        match cache.entry(gateway_endpoint.to_owned()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => Ok(vacant.insert(client).clone()),
        }
    }

    pub fn cached_gateway_count(&self) -> usize {
        self.gateway_cache.lock().len()
    }

    pub async fn power(
        &mut self,
        server_id: &str,
        action: PowerAction,
    ) -> Result<(), ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::PowerRequest {
                server_id: server_id.to_owned(),
            },
            &token,
        )?;
        let response = match action {
            PowerAction::On => gateway.power_on(request).await,
            PowerAction::Off => gateway.power_off(request).await,
            PowerAction::Cycle => gateway.power_cycle(request).await,
            PowerAction::Reset => gateway.reset(request).await,
        }
        .map_err(ClientError::from)?
        .into_inner();

        if response.success {
            Ok(())
        } else {
            Err(ClientError::Internal(response.message))
        }
    }

    pub async fn power_status(
        &mut self,
        server_id: &str,
    ) -> Result<model::PowerState, ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::PowerRequest {
                server_id: server_id.to_owned(),
            },
            &token,
        )?;
        let response = gateway
            .get_power_status(request)
            .await
            .map_err(ClientError::from)?
            .into_inner();
        Ok(model::PowerState::from(response.state))
    }

    pub async fn bmc_info(
        &mut self,
        server_id: &str,
    ) -> Result<common_protos::BmcInfo, ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::PowerRequest {
                server_id: server_id.to_owned(),
            },
            &token,
        )?;
        let response = gateway
            .get_bmc_info(request)
            .await
            .map_err(ClientError::from)?
            .into_inner();
        response
            .info
            .ok_or_else(|| ClientError::Internal("gateway returned empty BMC info".to_owned()))
    }

    pub async fn create_vnc_session(
        &mut self,
        server_id: &str,
    ) -> Result<gateway_protos::SessionResponse, ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::CreateSessionRequest {
                server_id: server_id.to_owned(),
            },
            &token,
        )?;
        gateway
            .create_vnc_session(request)
            .await
            .map_err(ClientError::from)
            .map(|r| r.into_inner())
    }

    pub async fn create_sol_session(
        &mut self,
        server_id: &str,
    ) -> Result<gateway_protos::SessionResponse, ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::CreateSessionRequest {
                server_id: server_id.to_owned(),
            },
            &token,
        )?;
        gateway
            .create_sol_session(request)
            .await
            .map_err(ClientError::from)
            .map(|r| r.into_inner())
    }

    /// Look up a VNC session which may live on any gateway we have talked
    /// to: every cached client is tried in turn and the first success wins.
    pub async fn find_vnc_session(
        &mut self,
        server_id: &str,
        session_id: &str,
    ) -> Result<gateway_protos::SessionResponse, ClientError> {
        // Resolving the server's own gateway first also primes the cache.
        let (_, token) = self.server_op_target(server_id).await?;

        let clients: Vec<GatewayClient<Channel>> =
            self.gateway_cache.lock().values().cloned().collect();
        for mut client in clients {
            let request = request_with_bearer(
                gateway_protos::SessionRequest {
                    session_id: session_id.to_owned(),
                },
                &token,
            )?;
            match client.get_vnc_session(request).await {
                Ok(response) => return Ok(response.into_inner()),
                Err(status) if status.code() == Code::NotFound => continue,
                Err(status) => {
                    log::debug!("gateway session lookup failed: {status}");
                    continue;
                }
            }
        }
        Err(ClientError::SessionNotFound(session_id.to_owned()))
    }

    pub async fn close_sol_session(
        &mut self,
        server_id: &str,
        session_id: &str,
    ) -> Result<(), ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::SessionRequest {
                session_id: session_id.to_owned(),
            },
            &token,
        )?;
        gateway
            .close_sol_session(request)
            .await
            .map_err(ClientError::from)?;
        Ok(())
    }

    /// Create a SOL session on the owning gateway and open the bidirectional
    /// console stream, leading with the handshake frame.
    pub async fn open_console(
        &mut self,
        server_id: &str,
    ) -> Result<ConsoleConnection, ClientError> {
        let (mut gateway, token) = self.server_op_target(server_id).await?;
        let request = request_with_bearer(
            gateway_protos::CreateSessionRequest {
                server_id: server_id.to_owned(),
            },
            &token,
        )?;
        let session = gateway
            .create_sol_session(request)
            .await
            .map_err(ClientError::from)?
            .into_inner();

        let (sender, receiver) = mpsc::channel::<ConsoleDataChunk>(32);
        sender
            .send(ConsoleDataChunk {
                session_id: session.session_id.clone(),
                server_id: server_id.to_owned(),
                data: Default::default(),
                is_handshake: true,
                close_stream: false,
            })
            .await
            .map_err(|_| ClientError::Internal("console channel closed".to_owned()))?;

        let request = request_with_bearer(ReceiverStream::new(receiver), &token)?;
        let inbound = gateway
            .stream_console_data(request)
            .await
            .map_err(ClientError::from)?
            .into_inner();

        Ok(ConsoleConnection {
            session_id: session.session_id,
            server_id: server_id.to_owned(),
            sender,
            inbound,
        })
    }
}
