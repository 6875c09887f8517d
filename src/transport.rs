use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{AddressType, BDAddr, WriteType};
use futures::Stream;

use crate::error::TransportError;
use crate::service::{CharacteristicInfo, Descriptor, Service};
use crate::{DiscoveredDevice, NotificationEvent};

pub type NotificationStream = Pin<Box<dyn Stream<Item = NotificationEvent> + Send>>;

/// Access to a local Bluetooth adapter.
///
/// Shared between the session driver and the background task that bounds a
/// connection attempt, hence `Send + Sync + 'static`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    /// Scans for advertising peripherals for exactly `duration`.
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Opens a link to the peripheral. May never return.
    ///
    /// `address_type` is a hint. Backends whose host stack learns the address
    /// type from the advertisement, such as [`BtleplugTransport`](crate::BtleplugTransport),
    /// ignore it.
    async fn connect(
        &self,
        address: BDAddr,
        address_type: AddressType,
    ) -> Result<Self::Link, TransportError>;

    /// Tears down whatever a timed-out [`connect`](Transport::connect) left behind.
    async fn abandon(&self, address: BDAddr);
}

/// A live link to one peripheral.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    fn address(&self) -> BDAddr;

    async fn is_connected(&self) -> Result<bool, TransportError>;

    /// Discovers services, characteristics and descriptors in one pass.
    async fn discover(&self) -> Result<Vec<Service>, TransportError>;

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>, TransportError>;

    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicInfo,
        descriptor: &Descriptor,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Stream of every notification the peripheral sends on this link.
    async fn notifications(&self) -> Result<NotificationStream, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
