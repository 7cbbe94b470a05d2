use chrono::{DateTime, Duration, Utc};
use model::{BmcCredentials, Server};
use rpc_util::auth::{issue_jwt, JWKSet, ServerContext, SessionClaims, TokenUse};
use rpc_util::seal::SealingKey;
use tonic::Status;

use crate::repository::Customer;

const ACCESS_TTL_HOURS: i64 = 24;
const REFRESH_TTL_DAYS: i64 = 7;
const SERVER_TTL_HOURS: i64 = 1;

/// Mints every token the manager hands out: tenant access/refresh pairs and
/// per-server delegated tokens with sealed BMC context.
#[derive(Clone)]
pub struct TokenIssuer {
    key_id: String,
    secret: Vec<u8>,
    sealing_key: Option<SealingKey>,
}

impl TokenIssuer {
    pub fn new(key_id: String, secret: Vec<u8>, sealing_key: Option<SealingKey>) -> Self {
        TokenIssuer {
            key_id,
            secret,
            sealing_key,
        }
    }

    /// The JWK set that validates tokens minted by this issuer.
    pub fn jwk_set(&self) -> JWKSet {
        rpc_util::auth::octet_jwk_set(&self.key_id, &self.secret)
    }

    pub fn issue_access(
        &self,
        customer: &Customer,
    ) -> Result<(String, DateTime<Utc>), Status> {
        self.issue_session(customer, TokenUse::Access, Duration::hours(ACCESS_TTL_HOURS))
    }

    pub fn issue_refresh(
        &self,
        customer: &Customer,
    ) -> Result<(String, DateTime<Utc>), Status> {
        self.issue_session(customer, TokenUse::Refresh, Duration::days(REFRESH_TTL_DAYS))
    }

    fn issue_session(
        &self,
        customer: &Customer,
        token_use: TokenUse,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), Status> {
        issue_jwt(
            SessionClaims {
                customer_id: customer.id.clone(),
                email: customer.email.clone(),
                admin: customer.is_admin,
            },
            token_use,
            ttl,
            &self.key_id,
            &self.secret,
        )
        .map_err(|err| {
            log::error!("failed to mint {token_use} token: {err}");
            Status::internal("failed to mint token")
        })
    }

    /// Mint a delegated token binding (customer, server) with just enough
    /// context for a gateway to dispatch one call. Credentials ride along
    /// sealed; the gateway cannot open them.
    pub fn issue_server_token(
        &self,
        customer_id: &str,
        server: &Server,
    ) -> Result<(String, DateTime<Utc>), Status> {
        let endpoint = server.primary_control_endpoint().ok_or_else(|| {
            Status::failed_precondition(format!("server {} has no control endpoints", server.id))
        })?;

        let sealed_credentials = match &self.sealing_key {
            Some(key) => {
                let credentials = BmcCredentials {
                    username: endpoint.username.clone(),
                    password: endpoint.password.clone(),
                };
                let plaintext = serde_json::to_vec(&credentials).map_err(|err| {
                    Status::internal(format!("failed to encode credentials: {err}"))
                })?;
                key.seal(&plaintext).map_err(|err| {
                    log::error!("failed to seal credentials for {}: {err}", server.id);
                    Status::internal("failed to seal credentials")
                })?
            }
            None => String::new(),
        };

        issue_jwt(
            ServerContext {
                customer_id: customer_id.to_owned(),
                server_id: server.id.clone(),
                datacenter_id: server.datacenter_id.clone(),
                endpoint: endpoint.endpoint.clone(),
                endpoint_type: endpoint.endpoint_type.to_string(),
                features: server.features.clone(),
                sealed_credentials,
            },
            TokenUse::Server,
            Duration::hours(SERVER_TTL_HOURS),
            &self.key_id,
            &self.secret,
        )
        .map_err(|err| {
            log::error!("failed to mint server token for {}: {err}", server.id);
            Status::internal("failed to mint token")
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use model::{ControlEndpoint, EndpointType, Server};
    use rpc_util::auth::{validate_jwt, ServerContext, SessionClaims, TokenUse, TEST_KEY_ID, TEST_SECRET};
    use rpc_util::seal::SealingKey;

    use super::TokenIssuer;
    use crate::repository::Customer;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(
            TEST_KEY_ID.to_owned(),
            TEST_SECRET.to_vec(),
            Some(SealingKey::from_bytes(&[9u8; 32]).unwrap()),
        )
    }

    fn customer() -> Customer {
        Customer {
            id: "cust-1".to_owned(),
            email: "test@example.com".to_owned(),
            password_hash: "x".to_owned(),
            api_key: "k".to_owned(),
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn access_token_expires_in_a_day_not_now() {
        let (token, expires_at) = issuer().issue_access(&customer()).unwrap();
        let now = Utc::now();
        // The regression this guards against set expires_at to `now`.
        assert!(expires_at > now + Duration::hours(23));
        assert!(expires_at < now + Duration::hours(25));

        let claims: SessionClaims =
            validate_jwt(&token, TokenUse::Access, &issuer().jwk_set()).unwrap();
        assert_eq!(claims.email, "test@example.com");
    }

    #[test]
    fn server_token_carries_sealed_credentials() {
        let server = Server {
            id: "srv-1".to_owned(),
            customer_id: "cust-1".to_owned(),
            datacenter_id: "dc-east-1".to_owned(),
            control_endpoints: vec![ControlEndpoint {
                endpoint: "192.168.1.100:623".to_owned(),
                endpoint_type: EndpointType::Ipmi,
                username: "admin".to_owned(),
                password: "secret".to_owned(),
                ..Default::default()
            }],
            primary_protocol: EndpointType::Ipmi,
            ..Default::default()
        };

        let (token, _) = issuer().issue_server_token("cust-1", &server).unwrap();
        let context: ServerContext =
            validate_jwt(&token, TokenUse::Server, &issuer().jwk_set()).unwrap();
        assert_eq!(context.server_id, "srv-1");
        assert_eq!(context.datacenter_id, "dc-east-1");
        assert_eq!(context.endpoint, "192.168.1.100:623");
        assert_eq!(context.endpoint_type, "ipmi");

        // The claims never contain the raw password, but the fleet key opens
        // the sealed blob.
        assert!(!token.contains("secret"));
        let key = SealingKey::from_bytes(&[9u8; 32]).unwrap();
        let opened = key.open(&context.sealed_credentials).unwrap();
        let credentials: model::BmcCredentials = serde_json::from_slice(&opened).unwrap();
        assert_eq!(credentials.username, "admin");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn server_token_without_endpoints_is_rejected() {
        let server = Server {
            id: "srv-1".to_owned(),
            ..Default::default()
        };
        let err = issuer().issue_server_token("cust-1", &server).expect_err("");
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }
}
