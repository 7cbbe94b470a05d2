use async_trait::async_trait;

use crate::error::BmcError;

use super::{Collection, Manager, RedfishDriver, SerialInterface};

/// What a vendor handler learned about out-of-band serial console access.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialConsoleDiscovery {
    /// "redfish_serial" or "ipmi_sol".
    pub console_type: String,
    /// Whether the vendor exposes a streamable console over Redfish.
    pub enabled: bool,
    /// Whether SOL should fall back to IPMI for this manager.
    pub fallback_to_ipmi: bool,
}

/// Vendor-specific Redfish behavior. Kept as a trait so new vendors slot in
/// without touching the driver.
#[async_trait]
pub(crate) trait VendorHandler: Send + Sync {
    fn vendor_type(&self) -> &'static str;

    async fn discover_serial_console(
        &self,
        driver: &RedfishDriver,
        manager: &Manager,
    ) -> Result<SerialConsoleDiscovery, BmcError>;
}

/// Pick the handler for a manager: the id mentioning iDRAC or a Dell
/// manufacturer selects the iDRAC handler, everything else is generic.
pub(crate) fn detect_vendor(manager: &Manager) -> Box<dyn VendorHandler> {
    let id = manager.id.to_ascii_lowercase();
    let manufacturer = manager.manufacturer.to_ascii_lowercase();
    if id.contains("idrac") || manufacturer.contains("dell") {
        Box::new(Idrac)
    } else {
        Box::new(Generic)
    }
}

struct Idrac;

#[async_trait]
impl VendorHandler for Idrac {
    fn vendor_type(&self) -> &'static str {
        "idrac"
    }

    /// iDRAC has no Redfish SOL streaming; whether IPMI SOL is available is
    /// read off the serial interface's InterfaceEnabled flag.
    async fn discover_serial_console(
        &self,
        driver: &RedfishDriver,
        manager: &Manager,
    ) -> Result<SerialConsoleDiscovery, BmcError> {
        let mut fallback_to_ipmi = false;
        if let Some(interfaces) = &manager.serial_interfaces {
            let collection: Collection = driver.get_json(&interfaces.odata_id).await?;
            if let Some(first) = collection.members.first() {
                let interface: SerialInterface = driver.get_json(&first.odata_id).await?;
                fallback_to_ipmi = interface.interface_enabled;
            }
        }
        Ok(SerialConsoleDiscovery {
            console_type: "ipmi_sol".to_owned(),
            enabled: false,
            fallback_to_ipmi,
        })
    }
}

struct Generic;

#[async_trait]
impl VendorHandler for Generic {
    fn vendor_type(&self) -> &'static str {
        "generic"
    }

    async fn discover_serial_console(
        &self,
        _driver: &RedfishDriver,
        manager: &Manager,
    ) -> Result<SerialConsoleDiscovery, BmcError> {
        let enabled = manager
            .serial_console
            .as_ref()
            .map(|c| c.service_enabled && !c.connect_types_supported.is_empty())
            .unwrap_or(false);
        Ok(SerialConsoleDiscovery {
            console_type: "redfish_serial".to_owned(),
            enabled,
            fallback_to_ipmi: false,
        })
    }
}
