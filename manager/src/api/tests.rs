use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use hyper::server::conn::AddrIncoming;
use protos::bmc::manager::v1 as manager_protos;
use protos::bmc::manager::v1::manager_client::ManagerClient;
use protos::bmc::v1 as common_protos;
use rpc_util::auth::{
    issue_jwt, make_test_jwk_set, validate_jwt, FleetToken, FleetTokenEntry, ServerContext,
    SessionClaims, TokenUse, TEST_KEY_ID, TEST_SECRET,
};
use rpc_util::hyper::AddrIncomingWithStream;
use rpc_util::seal::SealingKey;
use tonic::transport::Channel;
use tonic::{Code, Request};

use crate::repository::{Customer, MemoryRepository};
use crate::tokens::TokenIssuer;

use super::ManagerApi;

const SEAL_KEY: [u8; 32] = [5u8; 32];

fn make_incoming() -> (AddrIncomingWithStream, SocketAddr) {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let incoming = AddrIncoming::bind(&addr).expect("failed to bind port");
    let local_addr = incoming.local_addr();
    (AddrIncomingWithStream(incoming), local_addr)
}

fn fleet_tokens() -> HashMap<FleetToken, FleetTokenEntry> {
    let mut mapping = HashMap::new();
    for gateway_id in ["gw-east", "gw-west"] {
        mapping.insert(
            FleetToken::new(format!("fleet-{gateway_id}")),
            FleetTokenEntry {
                id: format!("entry-{gateway_id}"),
                gateway_id: gateway_id.to_owned(),
                is_active: true,
            },
        );
    }
    mapping
}

async fn start_manager() -> (ManagerClient<Channel>, ManagerApi, Customer) {
    let repository = Arc::new(MemoryRepository::new());
    let issuer = TokenIssuer::new(
        TEST_KEY_ID.to_owned(),
        TEST_SECRET.to_vec(),
        Some(SealingKey::from_bytes(&SEAL_KEY).unwrap()),
    );
    let api = ManagerApi::new(repository, issuer, fleet_tokens());
    let customer = api
        .bootstrap_customer("test@example.com", "password1", false)
        .await
        .unwrap();

    let (incoming, addr) = make_incoming();
    let (_shutdown_sender, shutdown_receiver) = tokio::sync::oneshot::channel::<()>();
    let server_fut = api.clone().serve_with_incoming_shutdown(
        incoming,
        shutdown_receiver.map(drop),
        None,
    );
    tokio::spawn(async move {
        let _ = server_fut.await;
    });

    let client = ManagerClient::connect(format!("http://{addr}"))
        .await
        .expect("connect to manager");
    (client, api, customer)
}

fn add_bearer<T>(request: &mut Request<T>, token: &str) {
    request.metadata_mut().insert(
        tonic::metadata::AsciiMetadataKey::from_str("authorization").unwrap(),
        tonic::metadata::AsciiMetadataValue::try_from(format!("Bearer {token}")).unwrap(),
    );
}

async fn login(client: &mut ManagerClient<Channel>) -> manager_protos::AuthenticateResponse {
    client
        .authenticate(Request::new(manager_protos::AuthenticateRequest {
            email: "test@example.com".to_owned(),
            password: "password1".to_owned(),
        }))
        .await
        .unwrap()
        .into_inner()
}

fn reported_server(datacenter_id: &str, endpoint: &str, customer_id: &str) -> common_protos::Server {
    common_protos::Server {
        customer_id: customer_id.to_owned(),
        datacenter_id: datacenter_id.to_owned(),
        control_endpoints: vec![common_protos::ControlEndpoint {
            endpoint: endpoint.to_owned(),
            r#type: common_protos::EndpointType::Ipmi as i32,
            username: "admin".to_owned(),
            password: "secret".to_owned(),
            ..Default::default()
        }],
        primary_protocol: common_protos::EndpointType::Ipmi as i32,
        status: "discovered".to_owned(),
        ..Default::default()
    }
}

async fn report(
    client: &mut ManagerClient<Channel>,
    gateway_id: &str,
    datacenter_id: &str,
    servers: Vec<common_protos::Server>,
) -> manager_protos::ReportAvailableEndpointsResponse {
    let mut request = Request::new(manager_protos::ReportAvailableEndpointsRequest {
        gateway_id: gateway_id.to_owned(),
        region: format!("region-{gateway_id}"),
        gateway_endpoint: format!("http://{gateway_id}.example.com:9443"),
        agent_id: format!("agent-{datacenter_id}"),
        agent_endpoint: format!("{datacenter_id}-agent:9444"),
        datacenter_id: datacenter_id.to_owned(),
        servers,
    });
    add_bearer(&mut request, &format!("fleet-{gateway_id}"));
    client
        .report_available_endpoints(request)
        .await
        .unwrap()
        .into_inner()
}

#[tokio::test]
async fn login_issues_day_long_token_and_lists_servers() {
    let (mut client, _api, customer) = start_manager().await;

    // Wrong password is rejected without revealing which part was wrong.
    let err = client
        .authenticate(Request::new(manager_protos::AuthenticateRequest {
            email: "test@example.com".to_owned(),
            password: "wrong".to_owned(),
        }))
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::Unauthenticated);

    let auth = login(&mut client).await;
    assert_eq!(auth.customer.unwrap().id, customer.id);

    // expires_at is a day out, not `now`.
    let expires_at = DateTime::parse_from_rfc3339(&auth.expires_at)
        .unwrap()
        .with_timezone(&Utc);
    assert!(expires_at > Utc::now() + Duration::hours(23));
    assert!(expires_at < Utc::now() + Duration::hours(25));

    // Without a token the call is rejected; with it, the empty list comes back.
    let err = client
        .list_servers(Request::new(manager_protos::ListServersRequest {}))
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::Unauthenticated);

    let mut request = Request::new(manager_protos::ListServersRequest {});
    add_bearer(&mut request, &auth.access_token);
    let servers = client.list_servers(request).await.unwrap().into_inner();
    assert_eq!(servers.servers, vec![]);
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let (mut client, _api, customer) = start_manager().await;
    let (expired, _) = issue_jwt(
        SessionClaims {
            customer_id: customer.id,
            email: customer.email,
            admin: false,
        },
        TokenUse::Access,
        Duration::hours(-1),
        TEST_KEY_ID,
        TEST_SECRET,
    )
    .unwrap();

    let mut request = Request::new(manager_protos::ListServersRequest {});
    add_bearer(&mut request, &expired);
    let err = client.list_servers(request).await.expect_err("");
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn refresh_reissues_access_only() {
    let (mut client, _api, _customer) = start_manager().await;
    let auth = login(&mut client).await;

    let refreshed = client
        .refresh_token(Request::new(manager_protos::RefreshTokenRequest {
            refresh_token: auth.refresh_token.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!refreshed.access_token.is_empty());

    // An access token is not accepted as a refresh token.
    let err = client
        .refresh_token(Request::new(manager_protos::RefreshTokenRequest {
            refresh_token: auth.access_token,
        }))
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn routing_resolves_each_server_to_its_gateway() {
    let (mut client, _api, customer) = start_manager().await;

    report(
        &mut client,
        "gw-east",
        "dc-a",
        vec![reported_server("dc-a", "192.168.1.100:623", &customer.id)],
    )
    .await;
    report(
        &mut client,
        "gw-west",
        "dc-b",
        vec![reported_server("dc-b", "192.168.2.100:623", &customer.id)],
    )
    .await;

    let auth = login(&mut client).await;
    let mut request = Request::new(manager_protos::ListServersRequest {});
    add_bearer(&mut request, &auth.access_token);
    let servers = client.list_servers(request).await.unwrap().into_inner().servers;
    assert_eq!(servers.len(), 2);

    let server_in_a = servers
        .iter()
        .find(|s| s.datacenter_id == "dc-a")
        .unwrap()
        .id
        .clone();
    let server_in_b = servers
        .iter()
        .find(|s| s.datacenter_id == "dc-b")
        .unwrap()
        .id
        .clone();

    for (server_id, expected_gateway) in [(&server_in_a, "gw-east"), (&server_in_b, "gw-west")] {
        let mut request = Request::new(manager_protos::GetServerLocationRequest {
            server_id: server_id.clone(),
        });
        add_bearer(&mut request, &auth.access_token);
        let location = client
            .get_server_location(request)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(location.gateway_id, expected_gateway);
        assert_eq!(
            location.gateway_endpoint,
            format!("http://{expected_gateway}.example.com:9443")
        );

        // Repeated calls yield identical tuples.
        let mut request = Request::new(manager_protos::GetServerLocationRequest {
            server_id: server_id.clone(),
        });
        add_bearer(&mut request, &auth.access_token);
        let again = client
            .get_server_location(request)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(location, again);
    }
}

#[tokio::test]
async fn rereporting_the_same_endpoint_is_idempotent() {
    let (mut client, _api, customer) = start_manager().await;

    report(
        &mut client,
        "gw-east",
        "dc-a",
        vec![reported_server("dc-a", "192.168.1.100:623", &customer.id)],
    )
    .await;
    report(
        &mut client,
        "gw-east",
        "dc-a",
        vec![reported_server("dc-a", "192.168.1.100:623", &customer.id)],
    )
    .await;

    let auth = login(&mut client).await;
    let mut request = Request::new(manager_protos::ListServersRequest {});
    add_bearer(&mut request, &auth.access_token);
    let servers = client.list_servers(request).await.unwrap().into_inner().servers;
    assert_eq!(servers.len(), 1);
    assert_eq!(
        servers[0].id,
        model::generate_server_id("dc-a", "192.168.1.100:623")
    );
    // Tenant-facing listings carry no credentials.
    assert!(servers[0].control_endpoints[0].password.is_empty());
}

#[tokio::test]
async fn server_token_binds_server_and_seals_credentials() {
    let (mut client, _api, customer) = start_manager().await;
    report(
        &mut client,
        "gw-east",
        "dc-a",
        vec![reported_server("dc-a", "192.168.1.100:623", &customer.id)],
    )
    .await;
    let server_id = model::generate_server_id("dc-a", "192.168.1.100:623");

    let auth = login(&mut client).await;
    let mut request = Request::new(manager_protos::GetServerTokenRequest {
        server_id: server_id.clone(),
    });
    add_bearer(&mut request, &auth.access_token);
    let response = client.get_server_token(request).await.unwrap().into_inner();

    let context: ServerContext =
        validate_jwt(&response.token, TokenUse::Server, &make_test_jwk_set()).unwrap();
    assert_eq!(context.server_id, server_id);
    assert_eq!(context.customer_id, customer.id);
    assert_eq!(context.datacenter_id, "dc-a");
    assert_eq!(context.endpoint_type, "ipmi");

    let opened = SealingKey::from_bytes(&SEAL_KEY)
        .unwrap()
        .open(&context.sealed_credentials)
        .unwrap();
    let credentials: model::BmcCredentials = serde_json::from_slice(&opened).unwrap();
    assert_eq!(credentials.password, "secret");
}

#[tokio::test]
async fn foreign_servers_are_invisible() {
    let (mut client, api, _customer) = start_manager().await;
    let other = api
        .bootstrap_customer("other@example.com", "password2", false)
        .await
        .unwrap();
    report(
        &mut client,
        "gw-east",
        "dc-a",
        vec![reported_server("dc-a", "192.168.1.100:623", &other.id)],
    )
    .await;
    let server_id = model::generate_server_id("dc-a", "192.168.1.100:623");

    let auth = login(&mut client).await;
    for rpc in ["get_server", "get_server_token", "get_server_location"] {
        let code = match rpc {
            "get_server" => {
                let mut request = Request::new(manager_protos::GetServerRequest {
                    server_id: server_id.clone(),
                });
                add_bearer(&mut request, &auth.access_token);
                client.get_server(request).await.expect_err("").code()
            }
            "get_server_token" => {
                let mut request = Request::new(manager_protos::GetServerTokenRequest {
                    server_id: server_id.clone(),
                });
                add_bearer(&mut request, &auth.access_token);
                client.get_server_token(request).await.expect_err("").code()
            }
            _ => {
                let mut request = Request::new(manager_protos::GetServerLocationRequest {
                    server_id: server_id.clone(),
                });
                add_bearer(&mut request, &auth.access_token);
                client
                    .get_server_location(request)
                    .await
                    .expect_err("")
                    .code()
            }
        };
        // Ownership failures are indistinguishable from absence.
        assert_eq!(code, Code::NotFound, "rpc {rpc}");
    }
}

#[tokio::test]
async fn fleet_reports_require_matching_identity() {
    let (mut client, _api, customer) = start_manager().await;

    // A token bound to gw-west cannot report as gw-east.
    let mut request = Request::new(manager_protos::ReportAvailableEndpointsRequest {
        gateway_id: "gw-east".to_owned(),
        region: "region-east".to_owned(),
        gateway_endpoint: "http://gw-east.example.com:9443".to_owned(),
        agent_id: "agent-dc-a".to_owned(),
        agent_endpoint: "dc-a-agent:9444".to_owned(),
        datacenter_id: "dc-a".to_owned(),
        servers: vec![reported_server("dc-a", "192.168.1.100:623", &customer.id)],
    });
    add_bearer(&mut request, "fleet-gw-west");
    let err = client
        .report_available_endpoints(request)
        .await
        .expect_err("");
    assert_eq!(err.code(), Code::Unauthenticated);
}
