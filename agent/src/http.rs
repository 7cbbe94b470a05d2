use warp::Filter;

use crate::store::ServerStore;

/// The agent's plain HTTP endpoints: a health check and the discovered BMC
/// list used by fleet tooling. Credentials are scrubbed before serialization.
pub fn routes(
    store: ServerStore,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health = warp::path("health").and(warp::get()).map(|| "OK");

    let store_filter = warp::any().map(move || store.clone());
    let bmcs = warp::path!("api" / "v1" / "bmcs")
        .and(warp::get())
        .and(store_filter)
        .map(|store: ServerStore| {
            let servers: Vec<_> = store.list().into_iter().map(|s| s.scrubbed()).collect();
            warp::reply::json(&servers)
        });

    health.or(bmcs)
}

/// Serve the HTTP endpoints until the process exits.
pub fn spawn(port: u16, store: ServerStore) {
    tokio::spawn(async move {
        log::info!("serving agent http endpoints on port {port}");
        warp::serve(routes(store)).run(([0, 0, 0, 0], port)).await;
    });
}

#[cfg(test)]
mod tests {
    use model::{ControlEndpoint, EndpointType, Server};

    use crate::store::ServerStore;

    use super::routes;

    fn store() -> ServerStore {
        let store = ServerStore::new();
        store.replace_all(vec![Server {
            id: "srv-1".to_owned(),
            datacenter_id: "dc-a".to_owned(),
            control_endpoints: vec![ControlEndpoint {
                endpoint: "192.168.1.100:623".to_owned(),
                endpoint_type: EndpointType::Ipmi,
                username: "admin".to_owned(),
                password: "secret".to_owned(),
                ..Default::default()
            }],
            primary_protocol: EndpointType::Ipmi,
            ..Default::default()
        }]);
        store
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let response = warp::test::request()
            .path("/health")
            .reply(&routes(store()))
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), "OK");
    }

    #[tokio::test]
    async fn bmc_list_is_scrubbed() {
        let response = warp::test::request()
            .path("/api/v1/bmcs")
            .reply(&routes(store()))
            .await;
        assert_eq!(response.status(), 200);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("192.168.1.100:623"));
        assert!(!body.contains("secret"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let response = warp::test::request()
            .path("/api/v2/nope")
            .reply(&routes(store()))
            .await;
        assert_eq!(response.status(), 404);
    }
}
