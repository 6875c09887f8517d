use std::fmt;
use std::time::Duration;

use btleplug::api::{AddressType, BDAddr};
use thiserror::Error;
use uuid::Uuid;

use crate::common::{characteristics::TARGET_CHARACTERISTIC, services::TARGET_SERVICE};
use crate::DiscoveredDevice;

pub const DEFAULT_PAYLOADS: [&str; 5] = [
    "00112233445566778899",
    "aabbccddeeff",
    "a1a2a3a4a5",
    "deadbeef",
    "f00dbabe",
];

pub const DEFAULT_REQUEST: &str = "a0b1c3e4f5";

pub struct ScanConfig {
    /// Index of the Bluetooth adapter to use. The first found adapter is used by default.
    adapter_index: usize,
    /// Length of the scan window.
    duration: Duration,
    /// Devices with a weaker signal than this (in dBm) are never connected to.
    minimum_rssi: i16,
    /// Filters the found devices based on device address.
    address_filter: Option<Box<dyn Fn(BDAddr) -> bool + Send + Sync>>,
    /// Filters the found devices based on local name.
    name_filter: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            duration: Duration::from_secs(3),
            minimum_rssi: -70,
            address_filter: None,
            name_filter: None,
        }
    }
}

impl fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfig")
            .field("adapter_index", &self.adapter_index)
            .field("duration", &self.duration)
            .field("minimum_rssi", &self.minimum_rssi)
            .field("address_filter", &self.address_filter.is_some())
            .field("name_filter", &self.name_filter.is_some())
            .finish()
    }
}

impl ScanConfig {
    /// Index of bluetooth adapter to use
    pub fn adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Scan for the given duration
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Ignore devices whose signal is weaker than `rssi` dBm
    pub fn minimum_rssi(mut self, rssi: i16) -> Self {
        self.minimum_rssi = rssi;
        self
    }

    /// Filter scanned devices based on the device address
    pub fn filter_by_address(
        mut self,
        func: impl Fn(BDAddr) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.address_filter = Some(Box::new(func));
        self
    }

    /// Filter scanned devices based on the device name
    pub fn filter_by_name(mut self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.name_filter = Some(Box::new(func));
        self
    }

    pub fn get_adapter_index(&self) -> usize {
        self.adapter_index
    }

    pub fn get_duration(&self) -> Duration {
        self.duration
    }

    pub fn get_minimum_rssi(&self) -> i16 {
        self.minimum_rssi
    }

    /// Whether a scanned device should be connected to.
    ///
    /// The RSSI floor is checked first. A name filter rejects devices that did
    /// not advertise a name.
    pub fn accepts(&self, device: &DiscoveredDevice) -> bool {
        if device.rssi < self.minimum_rssi {
            return false;
        }

        if let Some(filter_by_addr) = self.address_filter.as_ref() {
            if !filter_by_addr(device.address) {
                return false;
            }
        }

        if let Some(filter_by_name) = self.name_filter.as_ref() {
            return device.local_name().map_or(false, |name| filter_by_name(name));
        }

        true
    }
}

/// What to do when a best-effort step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Log discovery and subscription failures and carry on.
    #[default]
    Lenient,
    /// Skip the device when discovery or subscription fails.
    Strict,
}

/// Immutable settings of a session run.
#[derive(Debug)]
pub struct SessionConfig {
    pub(crate) scan: ScanConfig,
    pub(crate) connection_timeout: Duration,
    pub(crate) address_type: AddressType,
    pub(crate) service: Uuid,
    pub(crate) characteristic: Uuid,
    pub(crate) payloads: Vec<Vec<u8>>,
    pub(crate) request: Vec<u8>,
    pub(crate) settle_delay: Duration,
    pub(crate) notification_window: Duration,
    pub(crate) notification_windows: usize,
    pub(crate) notification_budget: Duration,
    pub(crate) read_response: bool,
    pub(crate) listen_for: Option<Duration>,
    pub(crate) strictness: Strictness,
    pub(crate) debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            connection_timeout: Duration::from_secs(5),
            address_type: AddressType::Public,
            service: TARGET_SERVICE,
            characteristic: TARGET_CHARACTERISTIC,
            payloads: DEFAULT_PAYLOADS
                .iter()
                .map(|payload| parse_hex(payload))
                .collect::<Result<_, _>>()
                .unwrap_or_default(),
            request: parse_hex(DEFAULT_REQUEST).unwrap_or_default(),
            settle_delay: Duration::from_millis(100),
            notification_window: Duration::from_millis(250),
            notification_windows: 10,
            notification_budget: Duration::from_millis(2500),
            read_response: true,
            listen_for: None,
            strictness: Strictness::Lenient,
            debug: true,
        }
    }
}

impl SessionConfig {
    pub fn scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    /// Give up on a connection attempt after `timeout`
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }

    /// Service and characteristic to exchange data with
    pub fn target(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service = service;
        self.characteristic = characteristic;
        self
    }

    /// Payloads written as commands, in order
    pub fn payloads(mut self, payloads: Vec<Vec<u8>>) -> Self {
        self.payloads = payloads;
        self
    }

    /// Payload written as an acknowledged request after the commands
    pub fn request(mut self, request: Vec<u8>) -> Self {
        self.request = request;
        self
    }

    /// Pause after every write
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Wait for at most `windows` notifications of `window` each, and no longer
    /// than `budget` in total, between the commands and the request
    pub fn notification_wait(mut self, window: Duration, windows: usize, budget: Duration) -> Self {
        self.notification_window = window;
        self.notification_windows = windows;
        self.notification_budget = budget;
        self
    }

    /// Read back a response after the request
    pub fn read_response(mut self, read: bool) -> Self {
        self.read_response = read;
        self
    }

    /// Stop listening after `duration` and move to the next device.
    /// Without a limit the session listens until interrupted.
    pub fn listen_for(mut self, duration: Option<Duration>) -> Self {
        self.listen_for = duration;
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Show informational output
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn get_scan(&self) -> &ScanConfig {
        &self.scan
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseHexError {
    #[error("hex string has odd length {0}")]
    OddLength(usize),
    #[error("invalid hex digit {digit:?} at position {position}")]
    InvalidDigit { digit: char, position: usize },
}

/// Decodes a hex string such as `deadbeef` into bytes.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, ParseHexError> {
    let digits = text.trim().chars().collect::<Vec<_>>();
    if digits.len() % 2 != 0 {
        return Err(ParseHexError::OddLength(digits.len()));
    }

    let value = |position: usize| {
        let digit = digits[position];
        digit
            .to_digit(16)
            .map(|nibble| nibble as u8)
            .ok_or(ParseHexError::InvalidDigit { digit, position })
    };

    (0..digits.len())
        .step_by(2)
        .map(|position| Ok(value(position)? << 4 | value(position + 1)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_payloads() {
        assert_eq!(parse_hex("deadbeef"), Ok(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_hex("A0b1"), Ok(vec![0xa0, 0xb1]));
        assert_eq!(parse_hex(""), Ok(vec![]));
        assert_eq!(parse_hex("abc"), Err(ParseHexError::OddLength(3)));
        assert_eq!(
            parse_hex("foodbabe"),
            Err(ParseHexError::InvalidDigit {
                digit: 'o',
                position: 1
            })
        );
    }

    #[test]
    fn default_session_carries_the_demo_payloads() {
        let config = SessionConfig::default();
        assert_eq!(config.payloads.len(), 5);
        assert_eq!(config.payloads[4], vec![0xf0, 0x0d, 0xba, 0xbe]);
        assert_eq!(config.request, vec![0xa0, 0xb1, 0xc3, 0xe4, 0xf5]);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.scan.minimum_rssi, -70);
    }

    #[test]
    fn rssi_floor_is_inclusive() {
        let scan = ScanConfig::default();
        let address = BDAddr::from([1, 2, 3, 4, 5, 6]);

        assert!(scan.accepts(&DiscoveredDevice::new(address, AddressType::Public, -70)));
        assert!(scan.accepts(&DiscoveredDevice::new(address, AddressType::Public, -60)));
        assert!(!scan.accepts(&DiscoveredDevice::new(address, AddressType::Public, -71)));
    }

    #[test]
    fn filters_apply_after_the_rssi_floor() {
        let wanted = BDAddr::from([1, 2, 3, 4, 5, 6]);
        let scan = ScanConfig::default()
            .filter_by_address(move |address| address == wanted)
            .filter_by_name(|name| name.starts_with("Lock"));

        let named =
            DiscoveredDevice::new(wanted, AddressType::Public, -50).with_field("name", "Lock-42");
        let unnamed = DiscoveredDevice::new(wanted, AddressType::Public, -50);
        let other = DiscoveredDevice::new(BDAddr::from([9; 6]), AddressType::Public, -50)
            .with_field("name", "Lock-1");

        assert!(scan.accepts(&named));
        assert!(!scan.accepts(&unnamed));
        assert!(!scan.accepts(&other));
    }
}
