use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use hyper::server::conn::AddrIncoming;
use parking_lot::Mutex;
use protos::bmc::agent::v1 as agent_protos;
use protos::bmc::agent::v1::agent_server::{Agent, AgentServer};
use protos::bmc::gateway::v1 as gateway_protos;
use protos::bmc::gateway::v1::gateway_client::GatewayClient;
use protos::bmc::manager::v1 as manager_protos;
use protos::bmc::manager::v1::manager_client::ManagerClient;
use protos::bmc::v1 as common_protos;
use protos::bmc::v1::ConsoleDataChunk;
use rpc_util::auth::{make_test_jwk_set, FleetToken, FleetTokenEntry, TEST_KEY_ID, TEST_SECRET};
use rpc_util::backend::{construct_channel, BackendConfig};
use rpc_util::hyper::AddrIncomingWithStream;
use rpc_util::seal::SealingKey;
use tokio::time::Duration;
use tonic::transport::{Channel, Server};
use tonic::{Code, Request, Response, Status, Streaming};

use manager::repository::MemoryRepository;
use manager::{ManagerApi, TokenIssuer};

use super::{GatewayApi, GatewayIdentity};

const SEAL_KEY: [u8; 32] = [5u8; 32];

fn make_incoming() -> (AddrIncomingWithStream, SocketAddr) {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let incoming = AddrIncoming::bind(&addr).expect("failed to bind port");
    let local_addr = incoming.local_addr();
    (AddrIncomingWithStream(incoming), local_addr)
}

fn add_bearer<T>(request: &mut Request<T>, token: &str) {
    request.metadata_mut().insert(
        tonic::metadata::AsciiMetadataKey::from_str("authorization").unwrap(),
        tonic::metadata::AsciiMetadataValue::try_from(format!("Bearer {token}")).unwrap(),
    );
}

/// Records calls and answers success; the console stream greets, echoes, and
/// relays close frames.
#[derive(Clone, Default)]
struct MockAgent {
    calls: Arc<Mutex<Vec<(String, String, bool)>>>,
}

impl MockAgent {
    fn record(&self, method: &str, req: &agent_protos::ServerRequest) {
        self.calls.lock().push((
            method.to_owned(),
            req.server_id.clone(),
            !req.sealed_context.is_empty(),
        ));
    }

    fn ok(&self) -> Result<Response<agent_protos::OpResponse>, Status> {
        Ok(Response::new(agent_protos::OpResponse {
            success: true,
            message: "ok".to_owned(),
        }))
    }
}

#[tonic::async_trait]
impl Agent for MockAgent {
    async fn power_on(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.record("power_on", request.get_ref());
        self.ok()
    }

    async fn power_off(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.record("power_off", request.get_ref());
        self.ok()
    }

    async fn power_cycle(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.record("power_cycle", request.get_ref());
        self.ok()
    }

    async fn reset(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::OpResponse>, Status> {
        self.record("reset", request.get_ref());
        self.ok()
    }

    async fn get_power_status(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::PowerStatusResponse>, Status> {
        self.record("get_power_status", request.get_ref());
        Ok(Response::new(agent_protos::PowerStatusResponse {
            state: common_protos::PowerState::On as i32,
        }))
    }

    async fn get_bmc_info(
        &self,
        request: Request<agent_protos::ServerRequest>,
    ) -> Result<Response<agent_protos::BmcInfoResponse>, Status> {
        self.record("get_bmc_info", request.get_ref());
        Ok(Response::new(agent_protos::BmcInfoResponse { info: None }))
    }

    type StreamConsoleStream =
        Pin<Box<dyn Stream<Item = Result<ConsoleDataChunk, Status>> + Send + 'static>>;

    async fn stream_console(
        &self,
        request: Request<Streaming<ConsoleDataChunk>>,
    ) -> Result<Response<Self::StreamConsoleStream>, Status> {
        let mut inbound = request.into_inner();
        let handshake = inbound
            .next()
            .await
            .unwrap_or_else(|| Err(Status::aborted("closed")))?;
        if !handshake.is_handshake {
            return Err(Status::invalid_argument("expected handshake"));
        }
        let out = async_stream::try_stream! {
            yield ConsoleDataChunk {
                session_id: handshake.session_id.clone(),
                server_id: handshake.server_id.clone(),
                data: bytes::Bytes::from_static(b"login: "),
                is_handshake: false,
                close_stream: false,
            };
            while let Some(frame) = inbound.next().await {
                let chunk = frame?;
                if chunk.close_stream {
                    yield chunk;
                    break;
                }
                yield chunk;
            }
        };
        Ok(Response::new(Box::pin(out)))
    }
}

struct Harness {
    gateway_client: GatewayClient<Channel>,
    manager_client: ManagerClient<Channel>,
    agent: MockAgent,
    server_id: String,
}

async fn start_harness() -> Harness {
    // Manager.
    let repository = Arc::new(MemoryRepository::new());
    let issuer = TokenIssuer::new(
        TEST_KEY_ID.to_owned(),
        TEST_SECRET.to_vec(),
        Some(SealingKey::from_bytes(&SEAL_KEY).unwrap()),
    );
    let mut fleet = std::collections::HashMap::new();
    fleet.insert(
        FleetToken::new("fleet-gw-east".to_owned()),
        FleetTokenEntry {
            id: "e1".to_owned(),
            gateway_id: "gw-east".to_owned(),
            is_active: true,
        },
    );
    let manager_api = ManagerApi::new(repository, issuer, fleet);
    let customer = manager_api
        .bootstrap_customer("test@example.com", "password1", false)
        .await
        .unwrap();
    let (manager_incoming, manager_addr) = make_incoming();
    let (_manager_shutdown, manager_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let manager_fut = manager_api.clone().serve_with_incoming_shutdown(
        manager_incoming,
        manager_shutdown_rx.map(drop),
        None,
    );
    tokio::spawn(async move {
        let _ = manager_fut.await;
    });

    // Mock agent.
    let agent = MockAgent::default();
    let (agent_incoming, agent_addr) = make_incoming();
    let agent_fut = Server::builder()
        .add_service(AgentServer::new(agent.clone()))
        .serve_with_incoming(agent_incoming);
    tokio::spawn(async move {
        let _ = agent_fut.await;
    });

    // Gateway.
    let manager_channel = construct_channel(BackendConfig::from_address(format!("{manager_addr}")))
        .await
        .unwrap();
    let gateway_api = GatewayApi::new(
        GatewayIdentity {
            gateway_id: "gw-east".to_owned(),
            region: "region-east".to_owned(),
            public_endpoint: "gw-east.example.com:9443".to_owned(),
            fleet_token: "fleet-gw-east".to_owned(),
            agent_token: None,
        },
        make_test_jwk_set(),
        ManagerClient::new(manager_channel),
        Duration::from_secs(3600),
    );
    let (gateway_incoming, gateway_addr) = make_incoming();
    let (_gateway_shutdown, gateway_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let gateway_fut = gateway_api.clone().serve_with_incoming_shutdown(
        gateway_incoming,
        gateway_shutdown_rx.map(drop),
        None,
    );
    tokio::spawn(async move {
        let _ = gateway_fut.await;
    });

    let mut gateway_client = GatewayClient::connect(format!("http://{gateway_addr}"))
        .await
        .unwrap();
    let manager_client = ManagerClient::connect(format!("http://{manager_addr}"))
        .await
        .unwrap();

    // The agent reports its server through the gateway.
    let report = gateway_protos::AgentReport {
        agent_id: "agent-dc-a".to_owned(),
        agent_endpoint: format!("{agent_addr}"),
        datacenter_id: "dc-a".to_owned(),
        servers: vec![common_protos::Server {
            customer_id: customer.id.clone(),
            datacenter_id: "dc-a".to_owned(),
            control_endpoints: vec![common_protos::ControlEndpoint {
                endpoint: "192.168.1.100:623".to_owned(),
                r#type: common_protos::EndpointType::Ipmi as i32,
                username: "admin".to_owned(),
                password: "secret".to_owned(),
                ..Default::default()
            }],
            primary_protocol: common_protos::EndpointType::Ipmi as i32,
            status: "discovered".to_owned(),
            ..Default::default()
        }],
    };
    let ack = gateway_client
        .report_available_endpoints(Request::new(report))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(ack.accepted, 1);

    Harness {
        gateway_client,
        manager_client,
        agent,
        server_id: model::generate_server_id("dc-a", "192.168.1.100:623"),
    }
}

async fn server_token(harness: &mut Harness) -> String {
    let auth = harness
        .manager_client
        .authenticate(Request::new(manager_protos::AuthenticateRequest {
            email: "test@example.com".to_owned(),
            password: "password1".to_owned(),
        }))
        .await
        .unwrap()
        .into_inner();
    let mut request = Request::new(manager_protos::GetServerTokenRequest {
        server_id: harness.server_id.clone(),
    });
    add_bearer(&mut request, &auth.access_token);
    harness
        .manager_client
        .get_server_token(request)
        .await
        .unwrap()
        .into_inner()
        .token
}

#[tokio::test]
async fn power_cycle_routes_through_to_the_owning_agent() {
    let mut harness = start_harness().await;
    let token = server_token(&mut harness).await;

    // No token: rejected before any agent call.
    let err = harness
        .gateway_client
        .power_cycle(Request::new(gateway_protos::PowerRequest {
            server_id: harness.server_id.clone(),
        }))
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::Unauthenticated);
    assert!(harness.agent.calls.lock().is_empty());

    let mut request = Request::new(gateway_protos::PowerRequest {
        server_id: harness.server_id.clone(),
    });
    add_bearer(&mut request, &token);
    let response = harness
        .gateway_client
        .power_cycle(request)
        .await
        .unwrap()
        .into_inner();
    assert!(response.success);

    let calls = harness.agent.calls.lock();
    assert_eq!(calls.len(), 1);
    let (method, server_id, sealed) = &calls[0];
    assert_eq!(method, "power_cycle");
    assert_eq!(server_id, &harness.server_id);
    // Credentials rode along sealed, not in the clear.
    assert!(sealed);
}

#[tokio::test]
async fn token_is_bound_to_one_server() {
    let mut harness = start_harness().await;
    let token = server_token(&mut harness).await;

    let mut request = Request::new(gateway_protos::PowerRequest {
        server_id: "srv-someone-else".to_owned(),
    });
    add_bearer(&mut request, &token);
    let err = harness.gateway_client.power_on(request).await.expect_err("");
    assert_eq!(err.code(), Code::PermissionDenied);
    assert!(harness.agent.calls.lock().is_empty());
}

#[tokio::test]
async fn vnc_session_lifecycle() {
    let mut harness = start_harness().await;
    let token = server_token(&mut harness).await;

    let mut request = Request::new(gateway_protos::CreateSessionRequest {
        server_id: harness.server_id.clone(),
    });
    add_bearer(&mut request, &token);
    let session = harness
        .gateway_client
        .create_vnc_session(request)
        .await
        .unwrap()
        .into_inner();
    assert!(session.session_id.starts_with("vnc-"));
    assert!(session.websocket_endpoint.contains("gw-east.example.com"));

    let mut request = Request::new(gateway_protos::SessionRequest {
        session_id: session.session_id.clone(),
    });
    add_bearer(&mut request, &token);
    let fetched = harness
        .gateway_client
        .get_vnc_session(request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(fetched.session_id, session.session_id);

    // A SOL lookup for a VNC session id is NotFound, as is an unknown id.
    let mut request = Request::new(gateway_protos::SessionRequest {
        session_id: session.session_id.clone(),
    });
    add_bearer(&mut request, &token);
    let err = harness
        .gateway_client
        .get_sol_session(request)
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::NotFound);

    let mut request = Request::new(gateway_protos::SessionRequest {
        session_id: session.session_id.clone(),
    });
    add_bearer(&mut request, &token);
    let closed = harness
        .gateway_client
        .close_vnc_session(request)
        .await
        .unwrap()
        .into_inner();
    assert!(closed.closed);

    let mut request = Request::new(gateway_protos::SessionRequest {
        session_id: session.session_id,
    });
    add_bearer(&mut request, &token);
    let err = harness
        .gateway_client
        .get_vnc_session(request)
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn console_stream_relays_frames_both_ways() {
    let mut harness = start_harness().await;
    let token = server_token(&mut harness).await;

    let mut request = Request::new(gateway_protos::CreateSessionRequest {
        server_id: harness.server_id.clone(),
    });
    add_bearer(&mut request, &token);
    let session = harness
        .gateway_client
        .create_sol_session(request)
        .await
        .unwrap()
        .into_inner();

    let session_id = session.session_id.clone();
    let server_id = harness.server_id.clone();
    let outbound = async_stream::stream! {
        yield ConsoleDataChunk {
            session_id: session_id.clone(),
            server_id: server_id.clone(),
            data: Default::default(),
            is_handshake: true,
            close_stream: false,
        };
        yield ConsoleDataChunk {
            session_id: session_id.clone(),
            server_id: server_id.clone(),
            data: bytes::Bytes::from_static(b"ls\n"),
            is_handshake: false,
            close_stream: false,
        };
        yield ConsoleDataChunk {
            session_id: session_id.clone(),
            server_id: server_id.clone(),
            data: Default::default(),
            is_handshake: false,
            close_stream: true,
        };
    };

    let mut request = Request::new(outbound);
    add_bearer(&mut request, &token);
    let mut inbound = harness
        .gateway_client
        .stream_console_data(request)
        .await
        .unwrap()
        .into_inner();

    let mut frames = Vec::new();
    while let Some(frame) = inbound.next().await {
        let chunk = frame.unwrap();
        let done = chunk.close_stream;
        frames.push(chunk);
        if done {
            break;
        }
    }

    // Greeting from the agent, the echoed keystrokes, then the close frame.
    assert!(frames.len() >= 3, "frames: {frames:?}");
    assert_eq!(&frames[0].data[..], b"login: ");
    assert_eq!(&frames[1].data[..], b"ls\n");
    assert!(frames.last().unwrap().close_stream);
}
