use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bmc::{BmcError, BmcExecutor};
use futures::{Stream, StreamExt};
use model::{BmcCredentials, Server};
use protos::bmc::agent::v1 as agent_protos;
use protos::bmc::agent::v1::agent_server::{Agent, AgentServer};
use protos::bmc::v1::ConsoleDataChunk;
use rpc_util::infra::GrpcConfig;
use rpc_util::seal::SealingKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tonic::transport::server::Connected;
use tonic::transport::Server as TransportServer;
use tonic::{Request, Response, Status, Streaming};

use crate::console;
use crate::store::ServerStore;

struct AgentInner {
    store: ServerStore,
    executor: BmcExecutor,
    sealing_key: Option<SealingKey>,
    ipmitool_path: String,
}

/// The agent's gRPC surface, spoken only by its regional gateway. Endpoint
/// credentials come from the local discovery store; a sealed context on the
/// request can override them when the fleet key is configured.
#[derive(Clone)]
pub struct AgentApi {
    inner: Arc<AgentInner>,
}

impl AgentApi {
    pub fn new(
        store: ServerStore,
        executor: BmcExecutor,
        sealing_key: Option<SealingKey>,
        ipmitool_path: String,
    ) -> Self {
        AgentApi {
            inner: Arc::new(AgentInner {
                store,
                executor,
                sealing_key,
                ipmitool_path,
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
            .add_service(AgentServer::new(self))
            .serve_with_incoming_shutdown(incoming, shutdown_signal)
            .await
    }

    /// Resolve the server named by a request from the local store, applying
    /// sealed credentials when present and openable. A blob we cannot open is
    /// logged and ignored; the store's credentials still apply.
    fn resolve_server(&self, request: &agent_protos::ServerRequest) -> Result<Server, Status> {
        let mut server = self.inner.store.get(&request.server_id).ok_or_else(|| {
            Status::not_found(format!("server {} not known to this agent", request.server_id))
        })?;

        if !request.sealed_context.is_empty() {
            if let Some(key) = &self.inner.sealing_key {
                match std::str::from_utf8(&request.sealed_context)
                    .map_err(|err| err.to_string())
                    .and_then(|sealed| key.open(sealed))
                    .and_then(|plain| {
                        serde_json::from_slice::<BmcCredentials>(&plain)
                            .map_err(|err| err.to_string())
                    }) {
                    Ok(credentials) => apply_credentials(&mut server, credentials),
                    Err(err) => {
                        log::warn!(
                            "ignoring unopenable sealed context for {}: {err}",
                            request.server_id
                        );
                    }
                }
            }
        }

        Ok(server)
    }

    async fn power_op<F, Fut>(
        &self,
        request: Request<agent_protos::ServerRequest>,
        f: F,
    ) -> Result<Response<agent_protos::OpResponse>, Status>
    where
        F: FnOnce(BmcExecutor, Server) -> Fut,
        Fut: Future<Output = Result<(), BmcError>>,
    {
        let server = self.resolve_server(request.get_ref())?;
        f(self.inner.executor.clone(), server).await?;
        Ok(Response::new(agent_protos::OpResponse {
            success: true,
            message: String::new(),
        }))
    }
}

/// Overlay sealed credentials onto the server's primary control endpoint.
fn apply_credentials(server: &mut Server, credentials: BmcCredentials) {
    let position = server
        .control_endpoints
        .iter()
        .position(|e| e.endpoint_type == server.primary_protocol)
        .unwrap_or(0);
    if let Some(endpoint) = server.control_endpoints.get_mut(position) {
        if !credentials.username.is_empty() {
            endpoint.username = credentials.username;
        }
        if !credentials.password.is_empty() {
            endpoint.password = credentials.password;
        }
    }
}

#[tonic::async_trait]
impl Agent for AgentApi {
    #[tracing::instrument(skip_all)]
    async fn power_on(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.power_op(request, |executor, server| async move {
            executor.power_on(&server).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn power_off(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.power_op(request, |executor, server| async move {
            executor.power_off(&server).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn power_cycle(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.power_op(request, |executor, server| async move {
            executor.power_cycle(&server).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn reset(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.power_op(request, |executor, server| async move {
            executor.reset(&server).await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn get_power_status(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::PowerStatusResponse>, Status> {
        let server = self.resolve_server(request.get_ref())?;
        let state = self.inner.executor.get_power_state(&server).await?;
        Ok(Response::new(agent_protos::PowerStatusResponse {
            state: protos::bmc::v1::PowerState::from(state) as i32,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn get_bmc_info(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::BmcInfoResponse>, Status> {
        let server = self.resolve_server(request.get_ref())?;
        let info = self.inner.executor.get_bmc_info(&server).await?;
        Ok(Response::new(agent_protos::BmcInfoResponse {
            info: Some(info.into()),
        }))
    }

    type StreamConsoleStream =
        Pin<Box<dyn Stream<Item = Result<ConsoleDataChunk, Status>> + Send + 'static>>;

    /// Attach a console stream to a SOL subprocess: inbound frames feed its
    /// stdin, its stdout flows back as data frames, and a close from either
    /// side tears the subprocess down.
    #[tracing::instrument(skip_all)]
    async fn stream_console(
        &self,
        request: Request<Streaming<ConsoleDataChunk>>,
    ) -> Result<Response<Self::StreamConsoleStream>, Status> {
        let mut inbound = request.into_inner();
        let handshake = inbound
            .next()
            .await
            .unwrap_or_else(|| Err(Status::aborted("connection closed before handshake")))?;
        if !handshake.is_handshake {
            return Err(Status::invalid_argument(
                "first console frame must be a handshake",
            ));
        }

        let server = self.inner.store.get(&handshake.server_id).ok_or_else(|| {
            Status::not_found(format!(
                "server {} not known to this agent",
                handshake.server_id
            ))
        })?;
        let mut child = console::spawn_sol_process(&server, &self.inner.ipmitool_path)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Status::internal("console process has no stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Status::internal("console process has no stdout"))?;

        log::info!(
            "console attached: session {} server {}",
            handshake.session_id,
            handshake.server_id
        );
        metrics::increment_counter!("bmc_agent_console_attaches_total");

        // Gateway -> subprocess stdin. Dropping stdin on exit closes the
        // child's input half.
        tokio::spawn(async move {
            while let Some(frame) = inbound.next().await {
                match frame {
                    Ok(chunk) => {
                        if chunk.close_stream {
                            break;
                        }
                        if !chunk.data.is_empty() && stdin.write_all(&chunk.data).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        log::debug!("console stream from gateway ended: {status}");
                        break;
                    }
                }
            }
        });

        // Subprocess stdout -> gateway, ending with an orderly close frame.
        // The child rides inside the stream so dropping the stream kills it.
        let session_id = handshake.session_id;
        let server_id = handshake.server_id;
        let out = async_stream::try_stream! {
            let mut child = child;
            let mut buf = [0u8; 4096];
            loop {
                let n = stdout
                    .read(&mut buf)
                    .await
                    .map_err(|err| Status::internal(format!("console read failed: {err}")))?;
                if n == 0 {
                    break;
                }
                yield ConsoleDataChunk {
                    session_id: session_id.clone(),
                    server_id: server_id.clone(),
                    data: bytes::Bytes::copy_from_slice(&buf[..n]),
                    is_handshake: false,
                    close_stream: false,
                };
            }
            let _ = child.kill().await;
            yield ConsoleDataChunk {
                session_id: session_id.clone(),
                server_id: server_id.clone(),
                data: Default::default(),
                is_handshake: false,
                close_stream: true,
            };
        };
        Ok(Response::new(Box::pin(out)))
    }
}
