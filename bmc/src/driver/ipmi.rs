use std::collections::HashMap;
use std::time::Duration;

use model::{ControlEndpoint, PowerState};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::BmcError;
use crate::info::{BmcDetail, BmcInfo, IpmiInfo};

const DEFAULT_IPMI_PORT: u16 = 623;

/// Chassis control commands understood by `ipmitool chassis power`.
#[derive(Clone, Copy, Debug)]
pub enum ChassisControl {
    On,
    Off,
    Cycle,
    Reset,
}

impl ChassisControl {
    fn arg(&self) -> &'static str {
        match self {
            ChassisControl::On => "on",
            ChassisControl::Off => "off",
            ChassisControl::Cycle => "cycle",
            ChassisControl::Reset => "reset",
        }
    }
}

/// Executes chassis and MC commands against an IPMI endpoint by shelling out
/// to an ipmitool binary. Tries the v2.0 `lanplus` interface first and falls
/// back to `lan` once per call.
#[derive(Clone, Debug)]
pub struct IpmiDriver {
    ipmitool_path: String,
    call_timeout: Duration,
}

impl Default for IpmiDriver {
    fn default() -> Self {
        IpmiDriver {
            ipmitool_path: "ipmitool".to_owned(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl IpmiDriver {
    pub fn new(ipmitool_path: impl Into<String>, call_timeout: Duration) -> Self {
        IpmiDriver {
            ipmitool_path: ipmitool_path.into(),
            call_timeout,
        }
    }

    pub async fn power_state(&self, endpoint: &ControlEndpoint) -> Result<PowerState, BmcError> {
        let output = self
            .run(endpoint, &["chassis", "power", "status"])
            .await?;
        Ok(parse_power_status(&output))
    }

    pub async fn chassis_control(
        &self,
        endpoint: &ControlEndpoint,
        control: ChassisControl,
    ) -> Result<(), BmcError> {
        self.run(endpoint, &["chassis", "power", control.arg()])
            .await
            .map(|_| ())
    }

    pub async fn bmc_info(&self, endpoint: &ControlEndpoint) -> Result<BmcInfo, BmcError> {
        let output = self.run(endpoint, &["mc", "info"]).await?;
        let attributes = parse_mc_info(&output);
        let info = IpmiInfo {
            device_id: attributes.get("Device ID").cloned().unwrap_or_default(),
            manufacturer: attributes
                .get("Manufacturer Name")
                .cloned()
                .unwrap_or_default(),
            ipmi_version: attributes.get("IPMI Version").cloned().unwrap_or_default(),
            attributes: attributes.clone(),
        };
        Ok(BmcInfo {
            vendor: info.manufacturer.clone(),
            model: attributes.get("Product Name").cloned().unwrap_or_default(),
            firmware_version: attributes
                .get("Firmware Revision")
                .cloned()
                .unwrap_or_default(),
            features: attributes
                .get("Additional Device Support")
                .map(|v| v.split(", ").map(str::to_owned).collect())
                .unwrap_or_default(),
            detail: BmcDetail::Ipmi(info),
            system_status: None,
        })
    }

    /// Run one ipmitool invocation against the endpoint, retrying once with
    /// the legacy `lan` interface when `lanplus` fails.
    async fn run(&self, endpoint: &ControlEndpoint, args: &[&str]) -> Result<String, BmcError> {
        let (host, port) = parse_ipmi_endpoint(&endpoint.endpoint)?;

        match self
            .run_with_interface(endpoint, &host, port, "lanplus", args)
            .await
        {
            Ok(output) => Ok(output),
            Err(err) => {
                let msg = err.to_string();
                log::warn!(
                    "ipmitool lanplus failed against {host}:{port} ({msg}); retrying with lan"
                );
                metrics::increment_counter!("bmc_ipmi_lan_fallback_total");
                self.run_with_interface(endpoint, &host, port, "lan", args)
                    .await
            }
        }
    }

    async fn run_with_interface(
        &self,
        endpoint: &ControlEndpoint,
        host: &str,
        port: u16,
        interface: &str,
        args: &[&str],
    ) -> Result<String, BmcError> {
        let port_str = port.to_string();
        let mut command = Command::new(&self.ipmitool_path);
        command
            .arg("-I")
            .arg(interface)
            .arg("-H")
            .arg(host)
            .arg("-p")
            .arg(&port_str);
        if !endpoint.username.is_empty() {
            command.arg("-U").arg(&endpoint.username);
        }
        if !endpoint.password.is_empty() {
            command.arg("-P").arg(&endpoint.password);
        }
        command.args(args);
        command
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = timeout(self.call_timeout, command.output())
            .await
            .map_err(|_| BmcError::Timeout {
                operation: format!("ipmitool {}", args.join(" ")),
                limit: self.call_timeout,
            })?
            .map_err(|err| BmcError::Transport(format!("failed to spawn ipmitool: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BmcError::Transport(format!(
                "ipmitool {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim(),
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `HOST[:PORT]`, tolerating an `ipmi://` scheme prefix.
pub fn parse_ipmi_endpoint(endpoint: &str) -> Result<(String, u16), BmcError> {
    let stripped = endpoint.trim_start_matches("ipmi://");
    if stripped.is_empty() {
        return Err(BmcError::Protocol(format!(
            "invalid IPMI endpoint: {endpoint:?}"
        )));
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                BmcError::Protocol(format!("invalid IPMI port in endpoint: {endpoint:?}"))
            })?;
            Ok((host.to_owned(), port))
        }
        None => Ok((stripped.to_owned(), DEFAULT_IPMI_PORT)),
    }
}

/// `chassis power status` says e.g. "Chassis Power is on". Anything that
/// matches neither phrasing is reported as unknown rather than an error.
fn parse_power_status(output: &str) -> PowerState {
    let lower = output.to_ascii_lowercase();
    if lower.contains("is on") {
        PowerState::On
    } else if lower.contains("is off") {
        PowerState::Off
    } else {
        PowerState::Unknown
    }
}

/// Parse the key-value report of `mc info`. Indented continuation lines
/// ("Additional Device Support" sub-items) are folded into the preceding
/// key as one comma-joined value.
fn parse_mc_info(output: &str) -> HashMap<String, String> {
    let mut attributes: HashMap<String, String> = HashMap::new();
    let mut last_key: Option<String> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let is_continuation = line.starts_with(char::is_whitespace);
        if is_continuation {
            if let Some(key) = &last_key {
                let entry = attributes.entry(key.clone()).or_default();
                if !entry.is_empty() {
                    entry.push_str(", ");
                }
                entry.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_owned();
            attributes.insert(key.clone(), value.trim().to_owned());
            last_key = Some(key);
        }
    }

    attributes
}
