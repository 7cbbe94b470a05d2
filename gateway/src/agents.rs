use std::collections::HashMap;

use ginepro::LoadBalancedChannel;
use parking_lot::RwLock;
use protos::bmc::agent::v1::agent_client::AgentClient;
use rpc_util::backend::{construct_channel, BackendConfig};

/// One registered in-datacenter agent.
#[derive(Clone)]
pub struct AgentEntry {
    pub agent_id: String,
    pub endpoint: String,
    pub client: AgentClient<LoadBalancedChannel>,
}

/// Agents keyed by the datacenter they serve. Entries are refreshed on every
/// endpoint report; a channel is only rebuilt when the agent's endpoint
/// actually changed.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        datacenter_id: &str,
        agent_id: &str,
        endpoint: &str,
    ) -> Result<(), String> {
        let unchanged = self
            .agents
            .read()
            .get(datacenter_id)
            .map(|entry| entry.agent_id == agent_id && entry.endpoint == endpoint)
            .unwrap_or(false);
        if unchanged {
            return Ok(());
        }

        let channel = construct_channel(BackendConfig::from_address(endpoint)).await?;
        let entry = AgentEntry {
            agent_id: agent_id.to_owned(),
            endpoint: endpoint.to_owned(),
            client: AgentClient::new(channel),
        };
        log::info!("agent {agent_id} at {endpoint} now serves datacenter {datacenter_id}");
        self.agents.write().insert(datacenter_id.to_owned(), entry);
        Ok(())
    }

    pub fn client_for(&self, datacenter_id: &str) -> Option<AgentClient<LoadBalancedChannel>> {
        self.agents
            .read()
            .get(datacenter_id)
            .map(|entry| entry.client.clone())
    }

    pub fn datacenter_ids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }
}
