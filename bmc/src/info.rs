use std::collections::HashMap;

use protos::bmc::v1 as common_protos;

/// Protocol-tagged detail for GetBMCInfo.
#[derive(Clone, Debug, PartialEq)]
pub enum BmcDetail {
    Ipmi(IpmiInfo),
    Redfish(RedfishInfo),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IpmiInfo {
    pub device_id: String,
    pub manufacturer: String,
    pub ipmi_version: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RedfishInfo {
    pub manager_id: String,
    pub manager_type: String,
    pub redfish_version: String,
    pub power_state: String,
    pub health: String,
}

/// Optional Redfish system health detail; absent when the system fetch is
/// degraded away.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemStatus {
    pub boot_progress: String,
    pub post_state: String,
    pub boot_source_override: String,
    pub bios_version: String,
    pub oem_health: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BmcInfo {
    pub vendor: String,
    pub model: String,
    pub firmware_version: String,
    pub features: Vec<String>,
    pub detail: BmcDetail,
    pub system_status: Option<SystemStatus>,
}

impl From<BmcInfo> for common_protos::BmcInfo {
    fn from(info: BmcInfo) -> Self {
        common_protos::BmcInfo {
            vendor: info.vendor,
            model: info.model,
            firmware_version: info.firmware_version,
            features: info.features,
            detail: Some(match info.detail {
                BmcDetail::Ipmi(i) => {
                    common_protos::bmc_info::Detail::Ipmi(common_protos::IpmiInfo {
                        device_id: i.device_id,
                        manufacturer: i.manufacturer,
                        ipmi_version: i.ipmi_version,
                        attributes: i.attributes,
                    })
                }
                BmcDetail::Redfish(r) => {
                    common_protos::bmc_info::Detail::Redfish(common_protos::RedfishInfo {
                        manager_id: r.manager_id,
                        manager_type: r.manager_type,
                        redfish_version: r.redfish_version,
                        power_state: r.power_state,
                        health: r.health,
                    })
                }
            }),
            system_status: info.system_status.map(|s| common_protos::SystemStatus {
                boot_progress: s.boot_progress,
                post_state: s.post_state,
                boot_source_override: s.boot_source_override,
                bios_version: s.bios_version,
                oem_health: s.oem_health,
            }),
        }
    }
}
