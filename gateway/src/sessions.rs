use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionKind {
    Vnc,
    Sol,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Vnc => write!(f, "vnc"),
            SessionKind::Sol => write!(f, "sol"),
        }
    }
}

/// One interactive console session owned by this gateway. Sessions are not
/// serializable across gateways; other gateways answer NotFound for this id.
#[derive(Clone, Debug)]
pub struct ConsoleSession {
    pub id: String,
    pub kind: SessionKind,
    pub server_id: String,
    pub customer_id: String,
    pub datacenter_id: String,
    pub websocket_endpoint: String,
    pub viewer_url: String,
    pub expires_at: DateTime<Utc>,
    deadline: Instant,
}

/// Registry of live sessions with TTL-based expiry. A background task wakes
/// at the earliest deadline and drops whatever has expired.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ConsoleSession>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry {
            sessions: Mutex::default(),
            ttl,
        });
        tokio::spawn(Self::expiration_task(Arc::downgrade(&registry)));
        registry
    }

    async fn expiration_task(registry: Weak<SessionRegistry>) {
        let mut next_deadline = Instant::now();
        loop {
            sleep_until(next_deadline).await;

            let Some(registry) = registry.upgrade() else {
                // The gateway is shutting down.
                return;
            };

            let now = Instant::now();
            next_deadline = now + registry.ttl;
            registry.sessions.lock().retain(|session_id, session| {
                if session.deadline <= now {
                    log::info!("session {session_id} expired");
                    false
                } else {
                    if session.deadline < next_deadline {
                        next_deadline = session.deadline;
                    }
                    true
                }
            });
        }
    }

    /// Allocate a session. Create/close for the same id is serialized by the
    /// registry lock; ids are never reused.
    pub fn create(
        &self,
        kind: SessionKind,
        server_id: &str,
        customer_id: &str,
        datacenter_id: &str,
        public_endpoint: &str,
    ) -> ConsoleSession {
        let id = format!("{kind}-{}", uuid::Uuid::new_v4());
        let viewer_url = match kind {
            SessionKind::Vnc => format!("https://{public_endpoint}/viewer/{id}"),
            SessionKind::Sol => String::new(),
        };
        let session = ConsoleSession {
            websocket_endpoint: format!("wss://{public_endpoint}/console/{id}"),
            viewer_url,
            id: id.clone(),
            kind,
            server_id: server_id.to_owned(),
            customer_id: customer_id.to_owned(),
            datacenter_id: datacenter_id.to_owned(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            deadline: Instant::now() + self.ttl,
        };
        self.sessions.lock().insert(id, session.clone());
        metrics::increment_counter!("bmc_gateway_sessions_created_total", "kind" => kind.to_string());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<ConsoleSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn close(&self, session_id: &str) -> Option<ConsoleSession> {
        let session = self.sessions.lock().remove(session_id);
        if session.is_some() {
            log::info!("session {session_id} closed");
        }
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update_gauges(&self) {
        let count = self.len();
        metrics::gauge!("bmc_gateway_sessions_active", count as f64);
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Duration;

    use super::{SessionKind, SessionRegistry};

    #[tokio::test]
    async fn create_get_close() {
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let session = registry.create(SessionKind::Vnc, "srv-1", "cust-1", "dc-1", "gw.example.com");
        assert!(session.id.starts_with("vnc-"));
        assert!(session.websocket_endpoint.contains(&session.id));
        assert!(!session.viewer_url.is_empty());

        let fetched = registry.get(&session.id).expect("session");
        assert_eq!(fetched.server_id, "srv-1");

        assert!(registry.close(&session.id).is_some());
        assert!(registry.get(&session.id).is_none());
        // Closing twice is a no-op.
        assert!(registry.close(&session.id).is_none());
    }

    #[tokio::test]
    async fn sol_sessions_have_no_viewer() {
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let session = registry.create(SessionKind::Sol, "srv-1", "cust-1", "dc-1", "gw.example.com");
        assert!(session.id.starts_with("sol-"));
        assert!(session.viewer_url.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_after_ttl() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = registry.create(SessionKind::Sol, "srv-1", "cust-1", "dc-1", "gw.example.com");
        assert!(registry.get(&session.id).is_some());

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(registry.get(&session.id).is_none());
    }
}
