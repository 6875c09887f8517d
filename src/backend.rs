use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    AddressType, BDAddr, Central, CentralEvent, Characteristic as BtleCharacteristic,
    Manager as _, Peripheral as _, ScanFilter, Service as BtleService, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use stream_cancel::Valved;

use crate::common::descriptors::{CLIENT_CHARACTERISTIC_CONFIGURATION, ENABLE_NOTIFICATION};
use crate::service::{CharacteristicInfo, Descriptor, HandleAllocator, Service};
use crate::transport::NotificationStream;
use crate::{DiscoveredDevice, Link, NotificationEvent, Transport, TransportError};

/// Transport on top of the host's Bluetooth stack.
pub struct BtleplugTransport {
    _manager: Manager,
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Opens the adapter with the given index.
    pub async fn new(adapter_index: usize) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if adapter_index >= adapters.len() {
            return Err(TransportError::NoAdapter(adapter_index));
        }

        let adapter = adapters.swap_remove(adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        Ok(Self {
            _manager: manager,
            adapter,
        })
    }

    async fn find(&self, address: BDAddr) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == address {
                return Ok(peripheral);
            }
        }

        Err(btleplug::Error::DeviceNotFound.into())
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let (stopper, mut events) = Valved::new(self.adapter.events().await?);

        self.adapter.start_scan(ScanFilter::default()).await?;

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            drop(stopper);
        });

        let mut seen = HashSet::new();
        let mut order = Vec::new();

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(peripheral_id)
                | CentralEvent::DeviceUpdated(peripheral_id) => {
                    if seen.insert(peripheral_id.clone()) {
                        order.push(peripheral_id);
                    }
                }
                _ => {}
            }
        }

        if let Err(error) = self.adapter.stop_scan().await {
            log::debug!("Failed to stop the scan cleanly: {}", error);
        }

        let mut devices = Vec::with_capacity(order.len());
        for peripheral_id in order {
            let peripheral = match self.adapter.peripheral(&peripheral_id).await {
                Ok(peripheral) => peripheral,
                Err(error) => {
                    log::trace!("Device {:?} vanished: {}", peripheral_id, error);
                    continue;
                }
            };

            if let Ok(Some(properties)) = peripheral.properties().await {
                devices.push(DiscoveredDevice::from_properties(&properties));
            }
        }

        Ok(devices)
    }

    async fn connect(
        &self,
        address: BDAddr,
        address_type: AddressType,
    ) -> Result<BtleplugLink, TransportError> {
        // The host stack remembers the address type from the advertisement.
        log::trace!("Connecting to {} ({:?} address)", address, address_type);

        let peripheral = self.find(address).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        Ok(BtleplugLink { peripheral })
    }

    async fn abandon(&self, address: BDAddr) {
        if let Ok(peripheral) = self.find(address).await {
            peripheral.disconnect().await.ok();
        }
    }
}

#[derive(Debug, Clone)]
pub struct BtleplugLink {
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(
        &self,
        info: &CharacteristicInfo,
    ) -> Result<BtleCharacteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| {
                characteristic.uuid == info.uuid && characteristic.service_uuid == info.service_uuid
            })
            .ok_or(TransportError::Btle(btleplug::Error::NoSuchCharacteristic))
    }
}

#[async_trait]
impl Link for BtleplugLink {
    #[inline]
    fn address(&self) -> BDAddr {
        self.peripheral.address()
    }

    async fn is_connected(&self) -> Result<bool, TransportError> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn discover(&self) -> Result<Vec<Service>, TransportError> {
        self.peripheral.discover_services().await?;
        Ok(attribute_table(&self.peripheral.services()))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.write(&characteristic, data, write_type).await?)
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicInfo,
        descriptor: &Descriptor,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;

        // The host stack owns the CCCD and refuses direct writes to it.
        if descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION
            && data == ENABLE_NOTIFICATION.as_slice()
        {
            return Ok(self.peripheral.subscribe(&characteristic).await?);
        }

        let target = characteristic
            .descriptors
            .iter()
            .find(|candidate| candidate.uuid == descriptor.uuid)
            .cloned()
            .ok_or_else(|| {
                TransportError::Other(format!(
                    "characteristic {} has no descriptor {}",
                    characteristic.uuid, descriptor.uuid
                ))
            })?;

        Ok(self.peripheral.write_descriptor(&target, data).await?)
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let mut handles = HashMap::new();
        for service in attribute_table(&self.peripheral.services()) {
            for characteristic in service.characteristics {
                handles
                    .entry(characteristic.uuid)
                    .or_insert(characteristic.handle);
            }
        }

        let stream = self.peripheral.notifications().await?;

        Ok(Box::pin(stream.map(move |notification| NotificationEvent {
            handle: handles.get(&notification.uuid).copied().unwrap_or_default(),
            payload: notification.value,
        })))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(self.peripheral.disconnect().await?)
    }
}

/// Numbers the discovered attributes the way a peripheral lays out its
/// attribute table: service, then for each characteristic its declaration,
/// value and descriptors.
fn attribute_table(services: &BTreeSet<BtleService>) -> Vec<Service> {
    let mut handles = HandleAllocator::default();
    let mut table = Vec::with_capacity(services.len());

    for service in services {
        let handle = handles.next_handle();
        let mut characteristics = Vec::with_capacity(service.characteristics.len());

        for characteristic in &service.characteristics {
            let _declaration = handles.next_handle();
            let value = handles.next_handle();
            let descriptors = characteristic
                .descriptors
                .iter()
                .map(|descriptor| Descriptor {
                    uuid: descriptor.uuid,
                    handle: handles.next_handle(),
                })
                .collect();

            characteristics.push(CharacteristicInfo {
                service_uuid: characteristic.service_uuid,
                uuid: characteristic.uuid,
                handle: value,
                properties: characteristic.properties,
                descriptors,
            });
        }

        table.push(Service {
            uuid: service.uuid,
            handle,
            primary: service.primary,
            characteristics,
        });
    }

    table
}
