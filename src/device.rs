use std::collections::BTreeMap;

use btleplug::api::{AddressType, BDAddr, PeripheralProperties};

/// A peripheral seen during a scan window.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: BDAddr,
    pub address_type: AddressType,
    /// Latest signal strength in dBm.
    pub rssi: i16,
    /// Advertisement fields rendered as text, keyed by field name.
    pub advertised: BTreeMap<String, String>,
}

impl DiscoveredDevice {
    pub fn new(address: BDAddr, address_type: AddressType, rssi: i16) -> Self {
        Self {
            address,
            address_type,
            rssi,
            advertised: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.advertised.insert(key.into(), value.into());
        self
    }

    /// Local name of the device
    #[inline]
    pub fn local_name(&self) -> Option<&str> {
        self.advertised.get("name").map(String::as_str)
    }

    /// Builds a device from the properties a host stack reports for it.
    ///
    /// Devices the stack never measured a signal for get `i16::MIN`, which no
    /// RSSI floor admits.
    pub fn from_properties(properties: &PeripheralProperties) -> Self {
        let mut device = DiscoveredDevice::new(
            properties.address,
            properties.address_type.unwrap_or(AddressType::Public),
            properties.rssi.unwrap_or(i16::MIN),
        );

        if let Some(name) = &properties.local_name {
            device = device.with_field("name", name.clone());
        }
        if let Some(tx_power) = properties.tx_power_level {
            device = device.with_field("tx_power", tx_power.to_string());
        }
        if !properties.services.is_empty() {
            let services = properties
                .services
                .iter()
                .map(|uuid| uuid.to_string())
                .collect::<Vec<_>>();
            device = device.with_field("services", services.join(","));
        }
        for (company, data) in &properties.manufacturer_data {
            device = device.with_field(format!("manufacturer:{:04x}", company), to_hex(data));
        }
        for (uuid, data) in &properties.service_data {
            device = device.with_field(format!("service_data:{}", uuid), to_hex(data));
        }

        device
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}
