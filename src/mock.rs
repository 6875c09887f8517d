//! Scripted in-memory transport.
//!
//! Every peripheral is described up front: how it reacts to a connection
//! attempt, which attributes it has and how reads, writes and notifications
//! behave. Each call is recorded in a journal with the (tokio) time it was
//! made, which makes ordering and timing observable in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{AddressType, BDAddr, CharPropFlags, WriteType};
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::common::{
    characteristics::TARGET_CHARACTERISTIC, descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
    services::TARGET_SERVICE,
};
use crate::service::{CharacteristicInfo, Descriptor, Service};
use crate::transport::NotificationStream;
use crate::{DiscoveredDevice, Link, NotificationEvent, Transport, TransportError};

/// The service the session looks for by default, as the mock serves it.
///
/// Service at handle `0x0010`, characteristic value at `0x0012`, client
/// characteristic configuration descriptor at `0x0013`.
pub fn target_service() -> Service {
    Service {
        uuid: TARGET_SERVICE,
        handle: 0x0010,
        primary: true,
        characteristics: vec![CharacteristicInfo {
            service_uuid: TARGET_SERVICE,
            uuid: TARGET_CHARACTERISTIC,
            handle: 0x0012,
            properties: CharPropFlags::READ
                | CharPropFlags::WRITE
                | CharPropFlags::WRITE_WITHOUT_RESPONSE
                | CharPropFlags::NOTIFY,
            descriptors: vec![Descriptor {
                uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                handle: 0x0013,
            }],
        }],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    /// Succeed after the given delay.
    Delay(Duration),
    Fail,
    /// Never return.
    Hang,
    PoweredDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Scan,
    Connect(BDAddr),
    Abandon(BDAddr),
    Discover(BDAddr),
    WriteDescriptor {
        address: BDAddr,
        handle: u16,
        data: Vec<u8>,
    },
    Write {
        address: BDAddr,
        handle: u16,
        data: Vec<u8>,
        write_type: WriteType,
    },
    Read {
        address: BDAddr,
        handle: u16,
    },
    Disconnect(BDAddr),
    /// A notification was taken off the link's notification stream.
    Notified {
        address: BDAddr,
        handle: u16,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct Record {
    pub at: Instant,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
pub struct MockPeripheral {
    device: DiscoveredDevice,
    connect: ConnectBehavior,
    services: Vec<Service>,
    discovery_fails: bool,
    descriptor_writes_fail: bool,
    writes_fail: bool,
    drop_link_after_writes: Option<usize>,
    read_response: Option<Vec<u8>>,
    queued: Vec<NotificationEvent>,
    connected: Arc<AtomicBool>,
    subscriber: Option<UnboundedSender<NotificationEvent>>,
    writes: usize,
}

impl MockPeripheral {
    /// A peripheral that accepts connections and serves [`target_service`].
    pub fn new(device: DiscoveredDevice) -> Self {
        Self {
            device,
            connect: ConnectBehavior::Succeed,
            services: vec![target_service()],
            discovery_fails: false,
            descriptor_writes_fail: false,
            writes_fail: false,
            drop_link_after_writes: None,
            read_response: Some(vec![0x00]),
            queued: Vec::new(),
            connected: Arc::new(AtomicBool::new(false)),
            subscriber: None,
            writes: 0,
        }
    }

    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn connect_behavior(mut self, behavior: ConnectBehavior) -> Self {
        self.connect = behavior;
        self
    }

    pub fn with_services(mut self, services: Vec<Service>) -> Self {
        self.services = services;
        self
    }

    /// Strips every descriptor from every characteristic
    pub fn without_descriptors(mut self) -> Self {
        for service in &mut self.services {
            for characteristic in &mut service.characteristics {
                characteristic.descriptors.clear();
            }
        }
        self
    }

    pub fn failing_discovery(mut self) -> Self {
        self.discovery_fails = true;
        self
    }

    pub fn failing_descriptor_writes(mut self) -> Self {
        self.descriptor_writes_fail = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.writes_fail = true;
        self
    }

    /// The peripheral goes away after accepting `writes` characteristic writes
    pub fn drop_link_after_writes(mut self, writes: usize) -> Self {
        self.drop_link_after_writes = Some(writes);
        self
    }

    pub fn read_response(mut self, response: Vec<u8>) -> Self {
        self.read_response = Some(response);
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.read_response = None;
        self
    }

    /// Queue a notification, delivered as soon as notifications are enabled
    pub fn notify(mut self, handle: u16, payload: Vec<u8>) -> Self {
        self.queued.push(NotificationEvent { handle, payload });
        self
    }

    fn go_away(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriber = None;
    }
}

#[derive(Debug, Default)]
struct State {
    peripherals: Vec<MockPeripheral>,
    journal: Vec<Record>,
    scan_error: Option<TransportError>,
    powered_down: bool,
}

impl State {
    fn record(&mut self, operation: Operation) {
        self.journal.push(Record {
            at: Instant::now(),
            operation,
        });
    }

    fn peripheral(&mut self, address: BDAddr) -> Result<&mut MockPeripheral, TransportError> {
        self.peripherals
            .iter_mut()
            .find(|peripheral| peripheral.device.address == address)
            .ok_or(TransportError::Btle(btleplug::Error::DeviceNotFound))
    }
}

/// Cloning shares the scripted peripherals and the journal.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peripheral. Scans report peripherals in the order they were added.
    pub fn with_peripheral(self, peripheral: MockPeripheral) -> Self {
        self.state().peripherals.push(peripheral);
        self
    }

    /// Makes every scan fail with `error`
    pub fn failing_scan(self, error: TransportError) -> Self {
        self.state().scan_error = Some(error);
        self
    }

    pub fn journal(&self) -> Vec<Record> {
        self.state().journal.clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state()
            .journal
            .iter()
            .map(|record| record.operation.clone())
            .collect()
    }

    /// Characteristic writes sent to `address`, in order
    pub fn writes(&self, address: BDAddr) -> Vec<(Vec<u8>, WriteType)> {
        self.state()
            .journal
            .iter()
            .filter_map(|record| match &record.operation {
                Operation::Write {
                    address: target,
                    data,
                    write_type,
                    ..
                } if *target == address => Some((data.clone(), *write_type)),
                _ => None,
            })
            .collect()
    }

    pub fn is_connected(&self, address: BDAddr) -> bool {
        self.state()
            .peripheral(address)
            .map(|peripheral| peripheral.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn fail_writes(&self, address: BDAddr, fail: bool) {
        if let Ok(peripheral) = self.state().peripheral(address) {
            peripheral.writes_fail = fail;
        }
    }

    /// Delivers a notification to the current subscriber of `address`, if any
    pub fn push_notification(&self, address: BDAddr, handle: u16, payload: Vec<u8>) {
        if let Ok(peripheral) = self.state().peripheral(address) {
            if let Some(subscriber) = &peripheral.subscriber {
                subscriber.send(NotificationEvent { handle, payload }).ok();
            }
        }
    }

    /// Simulates the local adapter losing power. Liveness checks on open links
    /// fail from then on.
    pub fn power_down(&self) {
        self.state().powered_down = true;
    }

    /// Simulates the peripheral ending the connection
    pub fn drop_link(&self, address: BDAddr) {
        if let Ok(peripheral) = self.state().peripheral(address) {
            peripheral.go_away();
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let devices = {
            let mut state = self.state();
            state.record(Operation::Scan);
            if let Some(error) = state.scan_error.take() {
                return Err(error);
            }
            state
                .peripherals
                .iter()
                .map(|peripheral| peripheral.device.clone())
                .collect()
        };

        tokio::time::sleep(duration).await;
        Ok(devices)
    }

    async fn connect(
        &self,
        address: BDAddr,
        _address_type: AddressType,
    ) -> Result<MockLink, TransportError> {
        let (behavior, connected) = {
            let mut state = self.state();
            state.record(Operation::Connect(address));
            let peripheral = state.peripheral(address)?;
            (peripheral.connect, peripheral.connected.clone())
        };

        match behavior {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            ConnectBehavior::Fail => {
                return Err(TransportError::Other("connection refused".to_string()))
            }
            ConnectBehavior::Hang => futures::future::pending::<()>().await,
            ConnectBehavior::PoweredDown => return Err(TransportError::PoweredDown),
        }

        connected.store(true, Ordering::SeqCst);
        Ok(MockLink {
            address,
            transport: self.clone(),
            connected,
        })
    }

    async fn abandon(&self, address: BDAddr) {
        let mut state = self.state();
        state.record(Operation::Abandon(address));
        if let Ok(peripheral) = state.peripheral(address) {
            peripheral.go_away();
        }
    }
}

#[derive(Debug)]
pub struct MockLink {
    address: BDAddr,
    transport: MockTransport,
    connected: Arc<AtomicBool>,
}

impl MockLink {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Link for MockLink {
    fn address(&self) -> BDAddr {
        self.address
    }

    async fn is_connected(&self) -> Result<bool, TransportError> {
        if self.transport.state().powered_down {
            return Err(TransportError::PoweredDown);
        }
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn discover(&self) -> Result<Vec<Service>, TransportError> {
        let mut state = self.transport.state();
        state.record(Operation::Discover(self.address));
        self.ensure_connected()?;

        let peripheral = state.peripheral(self.address)?;
        if peripheral.discovery_fails {
            return Err(TransportError::Other("discovery aborted".to_string()));
        }
        Ok(peripheral.services.clone())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        state.record(Operation::Write {
            address: self.address,
            handle: characteristic.handle,
            data: data.to_vec(),
            write_type,
        });
        self.ensure_connected()?;

        let peripheral = state.peripheral(self.address)?;
        if peripheral.writes_fail {
            return Err(TransportError::Other("write rejected".to_string()));
        }

        peripheral.writes += 1;
        if peripheral.drop_link_after_writes == Some(peripheral.writes) {
            peripheral.go_away();
        }
        Ok(())
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>, TransportError> {
        let mut state = self.transport.state();
        state.record(Operation::Read {
            address: self.address,
            handle: characteristic.handle,
        });
        self.ensure_connected()?;

        state
            .peripheral(self.address)?
            .read_response
            .clone()
            .ok_or_else(|| TransportError::Other("read not permitted".to_string()))
    }

    async fn write_descriptor(
        &self,
        _characteristic: &CharacteristicInfo,
        descriptor: &Descriptor,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        state.record(Operation::WriteDescriptor {
            address: self.address,
            handle: descriptor.handle,
            data: data.to_vec(),
        });
        self.ensure_connected()?;

        if state.peripheral(self.address)?.descriptor_writes_fail {
            return Err(TransportError::Other("write not permitted".to_string()));
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let mut state = self.transport.state();
        self.ensure_connected()?;

        let peripheral = state.peripheral(self.address)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        for event in peripheral.queued.drain(..) {
            sender.send(event).ok();
        }
        peripheral.subscriber = Some(sender);

        let transport = self.transport.clone();
        let address = self.address;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver).inspect(
            move |event| {
                transport.state().record(Operation::Notified {
                    address,
                    handle: event.handle,
                    payload: event.payload.clone(),
                })
            },
        )))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        state.record(Operation::Disconnect(self.address));
        state.peripheral(self.address)?.go_away();
        Ok(())
    }
}
