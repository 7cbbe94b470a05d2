pub mod ipmi;
pub mod redfish;

use std::time::Instant;

use model::{ControlEndpoint, EndpointType, PowerState, Server};

use crate::error::BmcError;
use crate::info::BmcInfo;

pub use ipmi::{ChassisControl, IpmiDriver};
pub use redfish::{RedfishDriver, ResetType, SessionTracker};

/// The unified operation set over both driver families. Dispatch is by the
/// server's primary control endpoint type.
#[derive(Clone, Default)]
pub struct BmcExecutor {
    ipmi: IpmiDriver,
    sessions: SessionTracker,
}

enum Dispatch<'a> {
    Ipmi(&'a ControlEndpoint),
    Redfish(Box<RedfishDriver>),
}

impl BmcExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ipmi_driver(ipmi: IpmiDriver) -> Self {
        BmcExecutor {
            ipmi,
            sessions: SessionTracker::new(),
        }
    }

    pub fn session_tracker(&self) -> &SessionTracker {
        &self.sessions
    }

    fn dispatch<'a>(&self, server: &'a Server) -> Result<Dispatch<'a>, BmcError> {
        let endpoint = server
            .primary_control_endpoint()
            .ok_or(BmcError::NoControlEndpoint)?;
        match endpoint.endpoint_type {
            EndpointType::Ipmi => Ok(Dispatch::Ipmi(endpoint)),
            EndpointType::Redfish => Ok(Dispatch::Redfish(Box::new(RedfishDriver::new(
                endpoint,
                self.sessions.clone(),
            )?))),
        }
    }

    pub async fn get_power_state(&self, server: &Server) -> Result<PowerState, BmcError> {
        self.timed(server, "get_power_state", |dispatch| async move {
            match dispatch {
                Dispatch::Ipmi(endpoint) => self.ipmi.power_state(endpoint).await,
                Dispatch::Redfish(driver) => driver.power_state().await,
            }
        })
        .await
    }

    pub async fn power_on(&self, server: &Server) -> Result<(), BmcError> {
        self.power_op(server, "power_on", ChassisControl::On, ResetType::On)
            .await
    }

    pub async fn power_off(&self, server: &Server) -> Result<(), BmcError> {
        self.power_op(server, "power_off", ChassisControl::Off, ResetType::ForceOff)
            .await
    }

    pub async fn power_cycle(&self, server: &Server) -> Result<(), BmcError> {
        self.power_op(
            server,
            "power_cycle",
            ChassisControl::Cycle,
            ResetType::PowerCycle,
        )
        .await
    }

    pub async fn reset(&self, server: &Server) -> Result<(), BmcError> {
        self.power_op(
            server,
            "reset",
            ChassisControl::Reset,
            ResetType::ForceRestart,
        )
        .await
    }

    pub async fn get_bmc_info(&self, server: &Server) -> Result<BmcInfo, BmcError> {
        self.timed(server, "get_bmc_info", |dispatch| async move {
            match dispatch {
                Dispatch::Ipmi(endpoint) => self.ipmi.bmc_info(endpoint).await,
                Dispatch::Redfish(driver) => driver.bmc_info().await,
            }
        })
        .await
    }

    async fn power_op(
        &self,
        server: &Server,
        op: &'static str,
        chassis: ChassisControl,
        reset: ResetType,
    ) -> Result<(), BmcError> {
        self.timed(server, op, |dispatch| async move {
            match dispatch {
                Dispatch::Ipmi(endpoint) => self.ipmi.chassis_control(endpoint, chassis).await,
                Dispatch::Redfish(driver) => driver.reset(reset).await,
            }
        })
        .await
    }

    async fn timed<'a, T, F, Fut>(
        &self,
        server: &'a Server,
        op: &'static str,
        f: F,
    ) -> Result<T, BmcError>
    where
        F: FnOnce(Dispatch<'a>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BmcError>>,
    {
        let dispatch = self.dispatch(server)?;
        let protocol = match &dispatch {
            Dispatch::Ipmi(_) => "ipmi",
            Dispatch::Redfish(_) => "redfish",
        };
        let start = Instant::now();
        let result = f(dispatch).await;
        metrics::histogram!(
            "bmc_operation_duration_seconds",
            start.elapsed(),
            "op" => op,
            "protocol" => protocol,
        );
        if let Err(err) = &result {
            metrics::increment_counter!(
                "bmc_operation_errors_total",
                "op" => op,
                "protocol" => protocol,
                "kind" => err.kind(),
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use model::{ControlEndpoint, EndpointType, Server};

    use super::BmcExecutor;
    use crate::error::BmcError;

    #[tokio::test]
    async fn dispatch_fails_fast_without_endpoints() {
        let executor = BmcExecutor::new();
        let server = Server {
            id: "srv-1".to_owned(),
            control_endpoints: vec![],
            ..Default::default()
        };
        let err = executor.get_power_state(&server).await.expect_err("");
        assert_eq!(err, BmcError::NoControlEndpoint);
    }

    #[tokio::test]
    async fn dispatch_selects_by_primary_endpoint_type() {
        let executor = BmcExecutor::new();
        let server = Server {
            id: "srv-1".to_owned(),
            control_endpoints: vec![ControlEndpoint {
                endpoint: "127.0.0.1:1".to_owned(),
                endpoint_type: EndpointType::Redfish,
                ..Default::default()
            }],
            primary_protocol: EndpointType::Redfish,
            ..Default::default()
        };
        // The endpoint is unreachable; what matters is that the redfish
        // driver was selected and produced a transport-flavored failure
        // rather than a dispatch failure.
        let err = executor.get_power_state(&server).await.expect_err("");
        assert_ne!(err, BmcError::NoControlEndpoint);
    }
}
