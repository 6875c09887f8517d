//! Scripted BLE session driver.
//!
//! Scans for nearby peripherals, and for every device with a strong enough
//! signal: connects under a hard timeout, discovers its attributes, looks up
//! one target characteristic, enables notifications on it, writes a fixed
//! sequence of payloads, optionally reads a response and then listens for
//! notifications until interrupted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use blesession::{BtleplugTransport, Error, ScanConfig, SessionConfig, SessionDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let config = SessionConfig::default()
//!         .scan(ScanConfig::default().minimum_rssi(-60))
//!         .listen_for(Some(Duration::from_secs(30)));
//!
//!     let transport = BtleplugTransport::new(0)
//!         .await
//!         .map_err(Error::RadioUnavailable)?;
//!
//!     let mut driver = SessionDriver::new(transport, config);
//!     let summary = driver
//!         .run_until(async {
//!             tokio::signal::ctrl_c().await.ok();
//!         })
//!         .await?;
//!     println!("{:?}", summary);
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use btleplug::api::{AddressType, BDAddr, WriteType};

pub use backend::{BtleplugLink, BtleplugTransport};
pub use characteristic::{CharacteristicHandle, Transceiver};
pub use config::{parse_hex, ParseHexError, ScanConfig, SessionConfig, Strictness};
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use device::DiscoveredDevice;
pub use driver::{DeviceOutcome, DeviceReport, RunSummary, SessionDriver};
pub use error::{Error, ExitStatus, Scope, TransportError};
pub use notification::{subscribe, NotificationEvent, NOTIFICATION_TARGET};
pub use service::{CharacteristicInfo, Descriptor, Service};
pub use transport::{Link, NotificationStream, Transport};

mod backend;
mod characteristic;
mod config;
mod connection;
mod device;
mod driver;
mod error;
mod notification;
mod service;
mod transport;

pub mod common;
pub mod discovery;
pub mod mock;
pub mod scanner;
