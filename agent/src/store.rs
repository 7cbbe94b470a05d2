use std::collections::HashMap;
use std::sync::Arc;

use model::Server;
use parking_lot::RwLock;

/// The agent's view of the BMCs it manages, refreshed by each discovery
/// cycle. This is the authority for endpoint credentials on the execution
/// path; nothing upstream ever sends them back in the clear.
#[derive(Clone, Default)]
pub struct ServerStore {
    inner: Arc<RwLock<HashMap<String, Server>>>,
}

impl ServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&self, servers: Vec<Server>) {
        let mut map = HashMap::with_capacity(servers.len());
        for server in servers {
            map.insert(server.id.clone(), server);
        }
        *self.inner.write() = map;
    }

    pub fn get(&self, server_id: &str) -> Option<Server> {
        self.inner.read().get(server_id).cloned()
    }

    pub fn list(&self) -> Vec<Server> {
        let mut servers: Vec<Server> = self.inner.read().values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
