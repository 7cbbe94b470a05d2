mod session;
mod vendor;

pub use session::SessionTracker;
pub use vendor::SerialConsoleDiscovery;
pub(crate) use vendor::detect_vendor;

use std::time::Duration;

use model::{ControlEndpoint, PowerState};
use serde::Deserialize;
use tokio::time::timeout;

use crate::error::BmcError;
use crate::info::{BmcDetail, BmcInfo, RedfishInfo, SystemStatus};

const SERVICE_ROOT_PATH: &str = "/redfish/v1/";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MANAGER_INFO_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SYSTEM_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Reset actions accepted by ComputerSystem.Reset.
#[derive(Clone, Copy, Debug)]
pub enum ResetType {
    On,
    ForceOff,
    PowerCycle,
    ForceRestart,
}

impl ResetType {
    fn as_str(&self) -> &'static str {
        match self {
            ResetType::On => "On",
            ResetType::ForceOff => "ForceOff",
            ResetType::PowerCycle => "PowerCycle",
            ResetType::ForceRestart => "ForceRestart",
        }
    }
}

/// HTTP/JSON driver for one Redfish endpoint. Sessions are tracked in the
/// shared `SessionTracker` so they can be reused across calls and deleted on
/// teardown.
pub struct RedfishDriver {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    sessions: SessionTracker,
    manager_info_timeout: Duration,
    system_info_timeout: Duration,
}

impl RedfishDriver {
    pub fn new(endpoint: &ControlEndpoint, sessions: SessionTracker) -> Result<Self, BmcError> {
        // BMCs almost always present self-signed certificates, so TLS
        // verification is opt-in via the endpoint's tls_verify flag.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!endpoint.tls_verify)
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|err| BmcError::Internal(format!("failed to build http client: {err}")))?;

        Ok(RedfishDriver {
            http,
            base_url: normalize_base_url(&endpoint.endpoint),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            sessions,
            manager_info_timeout: DEFAULT_MANAGER_INFO_TIMEOUT,
            system_info_timeout: DEFAULT_SYSTEM_INFO_TIMEOUT,
        })
    }

    /// Override the GetBMCInfo sub-fetch timeouts. Tests use this to avoid
    /// waiting out the production bounds.
    pub fn with_info_timeouts(mut self, manager: Duration, system: Duration) -> Self {
        self.manager_info_timeout = manager;
        self.system_info_timeout = system;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn credentials(&self) -> (&str, &str) {
        (&self.username, &self.password)
    }

    pub async fn power_state(&self) -> Result<PowerState, BmcError> {
        let system = self.first_system().await?;
        Ok(match system.power_state.to_ascii_lowercase().as_str() {
            "on" => PowerState::On,
            "off" => PowerState::Off,
            _ => PowerState::Unknown,
        })
    }

    pub async fn reset(&self, reset_type: ResetType) -> Result<(), BmcError> {
        let (system_path, system) = self.first_system_with_path().await?;
        let target = system
            .actions
            .reset
            .map(|a| a.target)
            .unwrap_or_else(|| join_url(&system_path, "Actions/ComputerSystem.Reset"));

        let token = self.sessions.ensure_session(self).await?;
        let url = join_url(&self.base_url, &target);
        let response = self
            .http
            .post(&url)
            .header("X-Auth-Token", token)
            .json(&serde_json::json!({ "ResetType": reset_type.as_str() }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BmcError::Protocol(format!(
                "ComputerSystem.Reset {} returned {}",
                reset_type.as_str(),
                response.status(),
            )));
        }
        Ok(())
    }

    /// Fetch manager info and system status under independent bounds. A slow
    /// or failing system fetch degrades to `system_status: None`; it never
    /// fails the whole call.
    pub async fn bmc_info(&self) -> Result<BmcInfo, BmcError> {
        let manager_fut = self.fetch_manager_info();
        let mut info = timeout(self.manager_info_timeout, manager_fut)
            .await
            .map_err(|_| BmcError::Timeout {
                operation: "redfish manager info".to_owned(),
                limit: self.manager_info_timeout,
            })??;

        info.system_status = match timeout(self.system_info_timeout, self.fetch_system_status())
            .await
        {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                log::warn!("system info fetch failed for {}: {err}", self.base_url);
                None
            }
            Err(_) => {
                log::warn!(
                    "system info fetch for {} exceeded {:?}",
                    self.base_url,
                    self.system_info_timeout
                );
                None
            }
        };

        Ok(info)
    }

    /// Delete any session this driver's endpoint holds.
    pub async fn teardown(&self) {
        self.sessions.close_session(self).await;
    }

    async fn fetch_manager_info(&self) -> Result<BmcInfo, BmcError> {
        let root: ServiceRoot = self.get_json(SERVICE_ROOT_PATH).await?;
        let managers_path = root
            .managers
            .ok_or_else(|| BmcError::Protocol("service root has no Managers".to_owned()))?
            .odata_id;
        let collection: Collection = self.get_json(&managers_path).await?;
        let manager_path = collection
            .members
            .first()
            .ok_or_else(|| BmcError::Protocol("Managers collection is empty".to_owned()))?
            .odata_id
            .clone();
        let manager: Manager = self.get_json(&manager_path).await?;

        let handler = detect_vendor(&manager);
        let console = handler.discover_serial_console(self, &manager).await;
        let mut features = Vec::new();
        match console {
            Ok(console) => {
                if console.enabled {
                    features.push(format!("console:{}", console.console_type));
                }
                if console.fallback_to_ipmi {
                    features.push("console:ipmi_fallback".to_owned());
                }
            }
            Err(err) => {
                log::warn!("serial console discovery failed for {}: {err}", self.base_url);
            }
        }

        Ok(BmcInfo {
            vendor: if manager.manufacturer.is_empty() {
                handler.vendor_type().to_owned()
            } else {
                manager.manufacturer.clone()
            },
            model: manager.model.clone(),
            firmware_version: manager.firmware_version.clone(),
            features,
            detail: BmcDetail::Redfish(RedfishInfo {
                manager_id: manager.id.clone(),
                manager_type: manager.manager_type.clone(),
                redfish_version: root.redfish_version,
                power_state: manager.power_state.clone(),
                health: manager
                    .status
                    .as_ref()
                    .map(|s| s.health.clone())
                    .unwrap_or_default(),
            }),
            system_status: None,
        })
    }

    async fn fetch_system_status(&self) -> Result<SystemStatus, BmcError> {
        let system = self.first_system().await?;
        Ok(SystemStatus {
            boot_progress: system
                .boot_progress
                .map(|p| p.last_state)
                .unwrap_or_default(),
            post_state: find_string_key(&system.oem, "PostState").unwrap_or_default(),
            boot_source_override: system.boot.boot_source_override_target,
            bios_version: system.bios_version,
            oem_health: collect_oem_health(&system.oem),
        })
    }

    async fn first_system(&self) -> Result<ComputerSystem, BmcError> {
        self.first_system_with_path().await.map(|(_, s)| s)
    }

    async fn first_system_with_path(&self) -> Result<(String, ComputerSystem), BmcError> {
        let root: ServiceRoot = self.get_json(SERVICE_ROOT_PATH).await?;
        let systems_path = root
            .systems
            .ok_or_else(|| BmcError::Protocol("service root has no Systems".to_owned()))?
            .odata_id;
        let collection: Collection = self.get_json(&systems_path).await?;
        let system_path = collection
            .members
            .first()
            .ok_or_else(|| BmcError::Protocol("Systems collection is empty".to_owned()))?
            .odata_id
            .clone();
        let system = self.get_json(&system_path).await?;
        Ok((system_path, system))
    }

    pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, BmcError> {
        let token = self.sessions.ensure_session(self).await?;
        let url = join_url(&self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header("X-Auth-Token", token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BmcError::Protocol(format!(
                "GET {path} returned {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| BmcError::Protocol(format!("GET {path}: invalid JSON: {err}")))
    }
}

/// Join a base URL and a path, tolerating trailing/leading slashes on either
/// side. Absolute paths replace any path on the base.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn normalize_base_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    }
}

/// Depth-first search for a string value under the given key anywhere in an
/// OEM blob.
fn find_string_key(value: &serde_json::Value, key: &str) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(s)) = map.get(key) {
                return Some(s.clone());
            }
            map.values().find_map(|v| find_string_key(v, key))
        }
        _ => None,
    }
}

/// Collect `<Component>: <Health>` rollups from OEM health blocks, i.e. any
/// nested object carrying a string "Health" member.
fn collect_oem_health(value: &serde_json::Value) -> std::collections::HashMap<String, String> {
    let mut rollups = std::collections::HashMap::new();
    if let serde_json::Value::Object(map) = value {
        for (name, nested) in map {
            if let serde_json::Value::Object(inner) = nested {
                if let Some(serde_json::Value::String(health)) = inner.get("Health") {
                    rollups.insert(name.clone(), health.clone());
                }
                rollups.extend(collect_oem_health(nested));
            }
        }
    }
    rollups
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ODataRef {
    #[serde(rename = "@odata.id")]
    pub(crate) odata_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceRoot {
    #[serde(rename = "RedfishVersion", default)]
    pub(crate) redfish_version: String,
    #[serde(rename = "Systems")]
    pub(crate) systems: Option<ODataRef>,
    #[serde(rename = "Managers")]
    pub(crate) managers: Option<ODataRef>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Collection {
    #[serde(rename = "Members", default)]
    pub(crate) members: Vec<ODataRef>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResourceStatus {
    #[serde(rename = "State", default)]
    pub(crate) _state: String,
    #[serde(rename = "Health", default)]
    pub(crate) health: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Boot {
    #[serde(rename = "BootSourceOverrideTarget", default)]
    pub(crate) boot_source_override_target: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BootProgress {
    #[serde(rename = "LastState", default)]
    pub(crate) last_state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActionTarget {
    pub(crate) target: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SystemActions {
    #[serde(rename = "#ComputerSystem.Reset")]
    pub(crate) reset: Option<ActionTarget>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ComputerSystem {
    #[serde(rename = "PowerState", default)]
    pub(crate) power_state: String,
    #[serde(rename = "BiosVersion", default)]
    pub(crate) bios_version: String,
    #[serde(rename = "Boot", default)]
    pub(crate) boot: Boot,
    #[serde(rename = "BootProgress")]
    pub(crate) boot_progress: Option<BootProgress>,
    #[serde(rename = "Actions", default)]
    pub(crate) actions: SystemActions,
    #[serde(rename = "Oem", default)]
    pub(crate) oem: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SerialConsole {
    #[serde(rename = "ServiceEnabled", default)]
    pub(crate) service_enabled: bool,
    #[serde(rename = "ConnectTypesSupported", default)]
    pub(crate) connect_types_supported: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Manager {
    #[serde(rename = "Id", default)]
    pub(crate) id: String,
    #[serde(rename = "ManagerType", default)]
    pub(crate) manager_type: String,
    #[serde(rename = "FirmwareVersion", default)]
    pub(crate) firmware_version: String,
    #[serde(rename = "Model", default)]
    pub(crate) model: String,
    #[serde(rename = "Manufacturer", default)]
    pub(crate) manufacturer: String,
    #[serde(rename = "PowerState", default)]
    pub(crate) power_state: String,
    #[serde(rename = "Status")]
    pub(crate) status: Option<ResourceStatus>,
    #[serde(rename = "SerialConsole")]
    pub(crate) serial_console: Option<SerialConsole>,
    #[serde(rename = "SerialInterfaces")]
    pub(crate) serial_interfaces: Option<ODataRef>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SerialInterface {
    #[serde(rename = "InterfaceEnabled", default)]
    pub(crate) interface_enabled: bool,
}
