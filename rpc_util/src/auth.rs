#![allow(clippy::result_large_err)]

use std::collections::HashMap;

use biscuit::errors::Error as BiscuitError;
use biscuit::errors::ValidationError;
use biscuit::jwa::{Algorithm, SignatureAlgorithm};
use biscuit::jwk::JWK;
use biscuit::Validation;
use biscuit::{ClaimPresenceOptions, TemporalOptions, ValidationOptions};
use biscuit::{Presence, SingleOrMultiple};
use chrono::{DateTime, Duration, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tonic::metadata::MetadataMap;
use tonic::Status;

/// What a JWT is good for, encoded in its audience claim. A token minted for
/// one use is never accepted for another.
#[derive(strum_macros::Display, Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenUse {
    #[strum(serialize = "bmc_access")]
    Access,
    #[strum(serialize = "bmc_refresh")]
    Refresh,
    #[strum(serialize = "bmc_server")]
    Server,
}

impl TokenUse {
    pub fn is_valid(&self, audience: &SingleOrMultiple<String>) -> bool {
        audience.contains(&self.to_string())
    }
}

/// Extract the bearer auth token from the request's headers.
///
/// Logs if there are any issues with the header.
pub fn get_bearer_token(metadata: &MetadataMap) -> Result<String, Status> {
    fn get(metadata: &MetadataMap) -> Result<String, String> {
        let auth_value = metadata
            .get("authorization")
            .ok_or("authorization header not provided")?
            .to_str()
            .map_err(|err| err.to_string())?;
        auth_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| "authorization header did not start with `Bearer `".to_owned())
            .map(|tok| tok.to_owned())
    }

    get(metadata).map_err(|err| {
        log::error!("auth_failure: missing or malformed authorization header: {err}");
        Status::unauthenticated("missing or invalid authorization header")
    })
}

// ---------------------------------------------------------------------------------------
// Fleet identity tokens (agent/gateway -> manager)
// ---------------------------------------------------------------------------------------

#[derive(Eq, Hash, PartialEq, Deserialize)]
pub struct FleetToken(String);

impl FleetToken {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    /// The first 10 characters of the token, with the rest truncated for security.
    pub fn truncated(&self) -> &str {
        let len = std::cmp::min(self.0.len(), 10);
        &self.0[0..len]
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FleetTokenEntry {
    /// The ID for this token entry.
    pub id: String,
    /// The gateway identity this token authenticates.
    pub gateway_id: String,
    /// Whether the token is still active, e.g. if expired or revoked.
    pub is_active: bool,
}

/// Validate a static fleet token against the configured mapping and check
/// that it authenticates the claimed gateway identity.
pub fn validate_fleet_token(
    token: FleetToken,
    claimed_gateway_id: &str,
    token_mapping: &HashMap<FleetToken, FleetTokenEntry>,
) -> Result<(), Status> {
    let entry = token_mapping.get(&token).ok_or_else(|| {
        log::error!("auth_failure: fleet token {}... not found", token.truncated());
        Status::unauthenticated("fleet token not valid")
    })?;
    if entry.gateway_id != claimed_gateway_id {
        log::error!(
            "auth_failure: claimed gateway {claimed_gateway_id} but token {}... is bound to {}",
            token.truncated(),
            entry.gateway_id,
        );
        return Err(Status::unauthenticated("fleet token not valid"));
    }
    if !entry.is_active {
        log::error!(
            "auth_failure: fleet token {}... is not active (gateway: {})",
            token.truncated(),
            entry.gateway_id,
        );
        return Err(Status::unauthenticated("fleet token not valid"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------------------
// JWT auth
// ---------------------------------------------------------------------------------------

/// Private claims of tenant access and refresh tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub customer_id: String,
    pub email: String,
    #[serde(default)]
    pub admin: bool,
}

/// Private claims of a delegated server token. The gateway uses these to
/// route one call; `sealed_credentials` is opaque to it and can only be
/// opened by agents holding the fleet sealing key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    pub customer_id: String,
    pub server_id: String,
    pub datacenter_id: String,
    pub endpoint: String,
    pub endpoint_type: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub sealed_credentials: String,
}

pub type JWKSet = biscuit::jwk::JWKSet<biscuit::Empty>;

pub fn deserialize_jwk_set(json: &str) -> Result<JWKSet, serde_json::Error> {
    serde_json::from_str(json)
}

/// Build a single-key HS256 JWK set from raw octet key material. Used by
/// binaries configured with a shared signing secret, and by tests.
pub fn octet_jwk_set(key_id: &str, secret: &[u8]) -> JWKSet {
    let jwk = JWK {
        common: biscuit::jwk::CommonParameters {
            key_id: Some(key_id.to_owned()),
            algorithm: Some(Algorithm::Signature(SignatureAlgorithm::HS256)),
            ..Default::default()
        },
        algorithm: biscuit::jwk::AlgorithmParameters::OctetKey(biscuit::jwk::OctetKeyParameters {
            value: secret.to_vec(),
            key_type: Default::default(),
        }),
        additional: Default::default(),
    };
    JWKSet { keys: vec![jwk] }
}

/// Mint a signed JWT with the given private claims, returning the encoded
/// token and its expiry instant.
pub fn issue_jwt<T>(
    private: T,
    token_use: TokenUse,
    ttl: Duration,
    key_id: &str,
    secret: &[u8],
) -> Result<(String, DateTime<Utc>), String>
where
    T: Serialize + DeserializeOwned,
{
    let now = Utc::now();
    let expires_at = now + ttl;
    let decoded_jwt = biscuit::JWT::new_decoded(
        biscuit::jws::Header::<biscuit::Empty> {
            registered: biscuit::jws::RegisteredHeader {
                key_id: Some(key_id.to_owned()),
                ..Default::default()
            },
            private: Default::default(),
        },
        biscuit::ClaimsSet::<T> {
            registered: biscuit::RegisteredClaims {
                issued_at: Some(biscuit::Timestamp::from(now)),
                expiry: Some(biscuit::Timestamp::from(expires_at)),
                audience: Some(SingleOrMultiple::Single(token_use.to_string())),
                ..Default::default()
            },
            private,
        },
    );
    let encoded_jwt = decoded_jwt
        .into_encoded(&biscuit::jws::Secret::Bytes(secret.to_vec()))
        .map_err(|err| format!("failed to sign token: {err}"))?;
    Ok((encoded_jwt.unwrap_encoded().to_string(), expires_at))
}

/// Validate the JWT signature and claims and return its private claims.
///
/// This intentionally returns vague messages for obfuscation/security, but it
/// logs the full error.
pub fn validate_jwt<T>(
    token: &str,
    token_use: TokenUse,
    jwk_set: &JWKSet,
) -> Result<T, Status>
where
    T: Serialize + DeserializeOwned + Clone,
{
    let jwt = biscuit::JWT::<T, biscuit::Empty>::new_encoded(token);
    let claims = decode_jwt(jwk_set, jwt).map_err(|err| {
        log::error!("auth_failure: token could not be decoded with our JWK set: {err}");
        Status::unauthenticated("authorization failed")
    })?;
    validate_claims_defined_and_not_expired(&claims.registered).map_err(|err| {
        log::error!("auth_failure: token validation failed: {err}");
        Status::unauthenticated("authorization failed")
    })?;

    let audience = claims.registered.audience.unwrap();
    if !token_use.is_valid(&audience) {
        log::error!(
            "auth_failure: token audience {audience:?} does not satisfy required use {token_use}",
        );
        return Err(Status::permission_denied("token not valid for this operation"));
    }

    Ok(claims.private)
}

fn decode_jwt<T>(
    jwk_set: &JWKSet,
    jwt: biscuit::JWT<T, biscuit::Empty>,
) -> Result<biscuit::ClaimsSet<T>, BiscuitError>
where
    T: Serialize + DeserializeOwned + Clone,
{
    // The JWKs will have the algorithm used already in their metadata.
    let decoded = jwt.decode_with_jwks(jwk_set, None)?;
    decoded.payload().map(|payload| payload.to_owned())
}

fn validate_claims_defined_and_not_expired(
    claims: &biscuit::RegisteredClaims,
) -> Result<(), ValidationError> {
    let validation_options = ValidationOptions {
        claim_presence_options: ClaimPresenceOptions {
            issued_at: Presence::Required,
            expiry: Presence::Required,
            audience: Presence::Required,
            not_before: Presence::Optional,
            issuer: Presence::Optional,
            subject: Presence::Optional,
            id: Presence::Optional,
        },
        temporal_options: TemporalOptions {
            epsilon: Duration::seconds(1),
            now: None,
        },
        // Check that iat is not in the future, but don't worry about it being too old of a token.
        issued_at: Validation::Validate(TimeDelta::MAX),
        // Check that the token has not expired.
        expiry: Validation::Validate(()),
        not_before: Validation::Ignored,
        issuer: Validation::Ignored,
        audience: Validation::Ignored,
    };
    claims.validate(validation_options)
}

/// A key id for use in testing. The JWT should have the same key id as its JWK.
pub const TEST_KEY_ID: &str = "bmc_test_key_1";

/// An octet secret to sign JWTs and to set up a JWK in tests.
pub const TEST_SECRET: &[u8] = b"0123456789ABCDEF";

/// A JWK set useful for tests, built from TEST_KEY_ID and TEST_SECRET.
pub fn make_test_jwk_set() -> JWKSet {
    octet_jwk_set(TEST_KEY_ID, TEST_SECRET)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::str::FromStr;

    use biscuit::{RegisteredClaims, SingleOrMultiple, Timestamp};
    use chrono::Duration;
    use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
    use tonic::{Code, Status};

    use super::{
        get_bearer_token, issue_jwt, make_test_jwk_set, validate_claims_defined_and_not_expired,
        validate_fleet_token, validate_jwt, FleetToken, FleetTokenEntry, ServerContext,
        SessionClaims, TokenUse, TEST_KEY_ID, TEST_SECRET,
    };

    fn claims() -> SessionClaims {
        SessionClaims {
            customer_id: "cust-1".to_owned(),
            email: "test@example.com".to_owned(),
            admin: false,
        }
    }

    #[test]
    fn test_validate_fleet_token() {
        fn validate(token: &str, claimed_gateway_id: &str) -> Result<(), Status> {
            let mut token_mapping = HashMap::new();
            token_mapping.insert(
                FleetToken::new("inactive-token".to_owned()),
                FleetTokenEntry {
                    id: "abc".to_owned(),
                    gateway_id: "gw-east".to_owned(),
                    is_active: false,
                },
            );
            token_mapping.insert(
                FleetToken::new("active-token".to_owned()),
                FleetTokenEntry {
                    id: "xyz".to_owned(),
                    gateway_id: "gw-east".to_owned(),
                    is_active: true,
                },
            );
            validate_fleet_token(
                FleetToken::new(token.to_owned()),
                claimed_gateway_id,
                &token_mapping,
            )
        }

        assert_eq!(
            validate("missing-token", "gw-east").expect_err("").code(),
            Code::Unauthenticated
        );
        assert_eq!(
            validate("inactive-token", "gw-east").expect_err("").code(),
            Code::Unauthenticated
        );
        assert!(validate("active-token", "gw-east").is_ok());
        assert_eq!(
            validate("active-token", "gw-west").expect_err("").code(),
            Code::Unauthenticated
        );
    }

    #[test]
    fn test_issue_and_validate_jwt() {
        let (token, expires_at) = issue_jwt(
            claims(),
            TokenUse::Access,
            Duration::hours(24),
            TEST_KEY_ID,
            TEST_SECRET,
        )
        .unwrap();
        assert!(expires_at > chrono::Utc::now() + Duration::hours(23));

        let decoded: SessionClaims =
            validate_jwt(&token, TokenUse::Access, &make_test_jwk_set()).unwrap();
        assert_eq!(decoded, claims());

        // An access token is not accepted where a refresh token is required.
        let err = validate_jwt::<SessionClaims>(&token, TokenUse::Refresh, &make_test_jwk_set())
            .expect_err("");
        assert_eq!(err.code(), Code::PermissionDenied);

        // A garbage token does not decode.
        let err = validate_jwt::<SessionClaims>("abc.def.ghi", TokenUse::Access, &make_test_jwk_set())
            .expect_err("");
        assert_eq!(err.code(), Code::Unauthenticated);

        // A token signed with the wrong secret does not validate.
        let (bad_token, _) = issue_jwt(
            claims(),
            TokenUse::Access,
            Duration::hours(24),
            TEST_KEY_ID,
            b"wrong_secret",
        )
        .unwrap();
        let err = validate_jwt::<SessionClaims>(&bad_token, TokenUse::Access, &make_test_jwk_set())
            .expect_err("");
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[test]
    fn test_server_token_roundtrip() {
        let context = ServerContext {
            customer_id: "cust-1".to_owned(),
            server_id: "srv-1".to_owned(),
            datacenter_id: "dc-east-1".to_owned(),
            endpoint: "192.168.1.100:623".to_owned(),
            endpoint_type: "ipmi".to_owned(),
            features: vec!["power".to_owned(), "console".to_owned()],
            sealed_credentials: "b64blob".to_owned(),
        };
        let (token, _) = issue_jwt(
            context.clone(),
            TokenUse::Server,
            Duration::hours(1),
            TEST_KEY_ID,
            TEST_SECRET,
        )
        .unwrap();
        let decoded: ServerContext =
            validate_jwt(&token, TokenUse::Server, &make_test_jwk_set()).unwrap();
        assert_eq!(decoded, context);
    }

    #[test]
    fn test_get_bearer_token() {
        let mut metadata = MetadataMap::new();
        assert_eq!(
            get_bearer_token(&metadata).expect_err("").code(),
            Code::Unauthenticated
        );

        metadata.insert(
            AsciiMetadataKey::from_str("authorization").unwrap(),
            AsciiMetadataValue::try_from("NotBearer abc").unwrap(),
        );
        assert_eq!(
            get_bearer_token(&metadata).expect_err("").code(),
            Code::Unauthenticated
        );

        metadata.insert(
            AsciiMetadataKey::from_str("authorization").unwrap(),
            AsciiMetadataValue::try_from("Bearer abc").unwrap(),
        );
        assert_eq!(get_bearer_token(&metadata).unwrap(), "abc");
    }

    #[test]
    fn test_validate_claims_defined_and_not_expired() {
        fn validate(
            issued_at: Option<Timestamp>,
            expiry: Option<Timestamp>,
            audience: Option<SingleOrMultiple<String>>,
        ) -> Result<(), biscuit::errors::ValidationError> {
            let registered = RegisteredClaims {
                issued_at,
                expiry,
                audience,
                ..Default::default()
            };
            validate_claims_defined_and_not_expired(&registered)
        }

        // Missing required claims.
        assert!(validate(None, None, None).is_err());

        // All good to go.
        let valid_issued_at = Some(Timestamp::from(
            chrono::Utc::now() - chrono::Duration::minutes(2),
        ));
        let valid_expiry = Some(Timestamp::from(
            chrono::Utc::now() + chrono::Duration::minutes(2),
        ));
        let valid_audience = Some(SingleOrMultiple::Single(TokenUse::Access.to_string()));
        assert!(validate(valid_issued_at, valid_expiry, valid_audience.clone()).is_ok());

        // Expired token.
        let invalid_expiry = Some(Timestamp::from(
            chrono::Utc::now() - Duration::minutes(3),
        ));
        assert!(matches!(
            validate(valid_issued_at, invalid_expiry, valid_audience),
            Err(biscuit::errors::ValidationError::Expired(_))
        ));
    }
}
