use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// A tenant's stored login state. `expires_at` tracks the access token; the
/// refresh token outlives it and is used to re-issue access without a new
/// password prompt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub customer_id: String,
    pub email: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    /// Purely local validity check; must run before any network I/O so an
    /// expired session fails fast without a round-trip.
    pub fn ensure_valid_token(&self) -> Result<(), ClientError> {
        if self.access_token.is_empty() {
            return Err(ClientError::AuthMissing);
        }
        match self.expires_at {
            Some(expires_at) if Utc::now() > expires_at => Err(ClientError::AuthExpired),
            _ => Ok(()),
        }
    }
}

/// Loads and persists the session file, `~/.bmc/session.yaml` by default.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        SessionStore { path }
    }

    pub fn default_path() -> Result<PathBuf, ClientError> {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| ClientError::Internal("HOME is not set".to_owned()))?;
        Ok(PathBuf::from(home).join(".bmc").join("session.yaml"))
    }

    pub fn load(&self) -> Result<Option<AuthSession>, ClientError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ClientError::Internal(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )))
            }
        };
        let session = serde_yaml::from_str(&raw).map_err(|err| {
            ClientError::Internal(format!("corrupt session file {}: {err}", self.path.display()))
        })?;
        Ok(Some(session))
    }

    pub fn save(&self, session: &AuthSession) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ClientError::Internal(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let raw = serde_yaml::to_string(session)
            .map_err(|err| ClientError::Internal(format!("failed to encode session: {err}")))?;
        std::fs::write(&self.path, raw).map_err(|err| {
            ClientError::Internal(format!("failed to write {}: {err}", self.path.display()))
        })
    }

    pub fn clear(&self) -> Result<(), ClientError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ClientError::Internal(format!(
                "failed to remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::error::ClientError;

    use super::AuthSession;

    #[test]
    fn empty_token_is_missing() {
        let session = AuthSession::default();
        assert_eq!(session.ensure_valid_token(), Err(ClientError::AuthMissing));
    }

    #[test]
    fn past_expiry_is_expired() {
        let session = AuthSession {
            access_token: "tok".to_owned(),
            expires_at: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(session.ensure_valid_token(), Err(ClientError::AuthExpired));
    }

    #[test]
    fn future_expiry_is_valid() {
        let session = AuthSession {
            access_token: "tok".to_owned(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        assert!(session.ensure_valid_token().is_ok());
    }
}
