use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::BmcError;

use super::{join_url, Collection, RedfishDriver};

const SESSIONS_PATH: &str = "/redfish/v1/SessionService/Sessions";

/// The phrasing BMCs use alongside (or instead of) a 503 when their session
/// table is full.
const SESSION_LIMIT_MARKER: &str = "The maximum number of user sessions is reached";

#[derive(Clone, Debug)]
struct ActiveSession {
    token: String,
    /// Resource URI of the session, used to DELETE it on teardown.
    location: String,
}

/// Tracks Redfish sessions per endpoint so that repeated operations reuse one
/// session and teardown can reliably delete what was created.
#[derive(Clone, Default)]
pub struct SessionTracker {
    active: Arc<RwLock<HashMap<String, ActiveSession>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a live session token for the driver's endpoint, creating a
    /// session if none is tracked.
    pub(crate) async fn ensure_session(&self, driver: &RedfishDriver) -> Result<String, BmcError> {
        if let Some(session) = self.active.read().get(driver.base_url()) {
            return Ok(session.token.clone());
        }

        let session = create_session(driver).await?;
        let token = session.token.clone();
        self.active
            .write()
            .insert(driver.base_url().to_owned(), session);
        Ok(token)
    }

    /// Delete the tracked session for the driver's endpoint, if any. Cleanup
    /// logs failures but never surfaces them.
    pub(crate) async fn close_session(&self, driver: &RedfishDriver) {
        let session = self.active.write().remove(driver.base_url());
        let Some(session) = session else { return };

        let url = join_url(driver.base_url(), &session.location);
        let result = driver
            .http()
            .delete(&url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await;
        if let Err(err) = result {
            log::warn!("failed to delete redfish session at {url}: {err}");
        }
    }

    /// Delete every tracked session. Called on agent shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<(String, ActiveSession)> = self.active.write().drain().collect();
        if drained.is_empty() {
            return;
        }
        let Ok(http) = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(std::time::Duration::from_secs(5))
            .build()
        else {
            return;
        };
        for (base_url, session) in drained {
            let url = join_url(&base_url, &session.location);
            if let Err(err) = http
                .delete(&url)
                .header("X-Auth-Token", &session.token)
                .send()
                .await
            {
                log::warn!("failed to delete redfish session at {url}: {err}");
            }
        }
    }
}

/// Create a session, recovering from a full session table exactly once by
/// deleting the existing sessions and retrying.
async fn create_session(driver: &RedfishDriver) -> Result<ActiveSession, BmcError> {
    match try_create_session(driver).await {
        Ok(session) => Ok(session),
        Err(BmcError::SessionLimit(msg)) => {
            log::info!(
                "session limit reached on {}: {msg}; deleting existing sessions and retrying",
                driver.base_url()
            );
            metrics::increment_counter!("bmc_redfish_session_cleanup_total");
            cleanup_sessions(driver).await?;
            try_create_session(driver).await
        }
        Err(err) => Err(err),
    }
}

async fn try_create_session(driver: &RedfishDriver) -> Result<ActiveSession, BmcError> {
    let (username, password) = driver.credentials();
    let url = join_url(driver.base_url(), SESSIONS_PATH);
    let response = driver
        .http()
        .post(&url)
        .json(&serde_json::json!({ "UserName": username, "Password": password }))
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        let body = response.text().await.unwrap_or_default();
        return Err(BmcError::SessionLimit(format!("{status}: {body}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if body.contains(SESSION_LIMIT_MARKER) {
            return Err(BmcError::SessionLimit(body));
        }
        return Err(BmcError::Protocol(format!(
            "session create returned {status}: {body}"
        )));
    }

    let token = response
        .headers()
        .get("X-Auth-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| {
            BmcError::Protocol("session create response missing X-Auth-Token header".to_owned())
        })?;
    let location = response
        .headers()
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| SESSIONS_PATH.to_owned());

    Ok(ActiveSession { token, location })
}

/// Enumerate and delete all sessions via Basic Auth. Used when the session
/// table is full and no token can be obtained.
async fn cleanup_sessions(driver: &RedfishDriver) -> Result<(), BmcError> {
    let (username, password) = driver.credentials();
    let url = join_url(driver.base_url(), SESSIONS_PATH);
    let collection: Collection = driver
        .http()
        .get(&url)
        .basic_auth(username, Some(password))
        .send()
        .await?
        .json()
        .await
        .map_err(|err| BmcError::Protocol(format!("session list: invalid JSON: {err}")))?;

    for member in collection.members {
        let session_url = join_url(driver.base_url(), &member.odata_id);
        let result = driver
            .http()
            .delete(&session_url)
            .basic_auth(username, Some(password))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                log::warn!(
                    "failed to delete session {session_url}: {}",
                    response.status()
                );
            }
            Err(err) => log::warn!("failed to delete session {session_url}: {err}"),
            Ok(_) => {}
        }
    }
    Ok(())
}
