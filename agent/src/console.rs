use bmc::parse_ipmi_endpoint;
use model::{EndpointType, Server, SolType};
use tokio::process::{Child, Command};
use tonic::Status;

/// Spawn the subprocess backing an interactive SOL session for a server.
///
/// Serial-over-LAN runs through `ipmitool sol activate`; servers whose only
/// console is a Redfish serial endpoint are rejected here and expected to
/// fall back to IPMI where the vendor allows it.
pub fn spawn_sol_process(server: &Server, ipmitool_path: &str) -> Result<Child, Status> {
    let (endpoint, username, password) = sol_target(server)?;
    let (host, port) = parse_ipmi_endpoint(&endpoint).map_err(Status::from)?;

    let mut command = Command::new(ipmitool_path);
    command
        .arg("-I")
        .arg("lanplus")
        .arg("-H")
        .arg(host)
        .arg("-p")
        .arg(port.to_string());
    if !username.is_empty() {
        command.arg("-U").arg(&username);
    }
    if !password.is_empty() {
        command.arg("-P").arg(&password);
    }
    command
        .arg("sol")
        .arg("activate")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    command.spawn().map_err(|err| {
        log::error!("failed to spawn sol process for {}: {err}", server.id);
        Status::unavailable(format!("failed to start console process: {err}"))
    })
}

/// Pick the endpoint and credentials to attach a SOL console to: the SOL
/// endpoint when it speaks IPMI, otherwise the primary IPMI control endpoint.
fn sol_target(server: &Server) -> Result<(String, String, String), Status> {
    if let Some(sol) = &server.sol_endpoint {
        match sol.effective_type() {
            SolType::Ipmi => {
                return Ok((
                    sol.endpoint.clone(),
                    sol.username.clone(),
                    sol.password.clone(),
                ))
            }
            SolType::RedfishSerial => {
                // Fall through to the IPMI control endpoint, if any.
            }
        }
    }
    server
        .control_endpoints
        .iter()
        .find(|e| e.endpoint_type == EndpointType::Ipmi)
        .map(|e| (e.endpoint.clone(), e.username.clone(), e.password.clone()))
        .ok_or_else(|| {
            Status::failed_precondition(format!(
                "server {} has no IPMI-capable console endpoint",
                server.id
            ))
        })
}
