#![deny(warnings)]

//! BMC drivers and the unified operation set over them. IPMI endpoints are
//! driven through an ipmitool subprocess, Redfish endpoints through an
//! HTTP/JSON client with managed sessions; callers see one set of power and
//! info operations dispatched by endpoint type.

pub mod driver;
mod error;
mod info;

pub use driver::ipmi::parse_ipmi_endpoint;
pub use driver::{
    BmcExecutor, ChassisControl, IpmiDriver, RedfishDriver, ResetType, SessionTracker,
};
pub use error::BmcError;
pub use info::{BmcDetail, BmcInfo, IpmiInfo, RedfishInfo, SystemStatus};
