use std::future::Future;
use std::sync::Arc;

use btleplug::api::BDAddr;
use tokio::time::Instant;

use crate::connection::ConnectionState;
use crate::device::to_hex;
use crate::error::Scope;
use crate::{
    discovery, notification, scanner, Connection, ConnectionManager, DiscoveredDevice, Error,
    SessionConfig, Strictness, Transceiver, Transport,
};

#[derive(Debug)]
pub enum DeviceOutcome {
    /// The exchange ran and the listen phase ended.
    Completed,
    /// The device was given up on; the run went on with the next candidate.
    Skipped(Error),
}

#[derive(Debug)]
pub struct DeviceReport {
    pub address: BDAddr,
    /// State of the connection when it was torn down.
    pub state: ConnectionState,
    pub outcome: DeviceOutcome,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    /// Devices seen during the scan.
    pub scanned: usize,
    /// Devices that passed the scan filters.
    pub candidates: usize,
    pub devices: Vec<DeviceReport>,
}

/// Runs the whole session: scan, then one device at a time connect, discover,
/// subscribe, exchange and listen.
///
/// Per-device failures skip the device. Only adapter-level failures, a user
/// interrupt and a peripheral leaving during the listen phase end the run.
pub struct SessionDriver<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    connections: ConnectionManager<T>,
    transceiver: Transceiver,
    current: Option<Connection<T::Link>>,
}

impl<T: Transport> SessionDriver<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let transport = Arc::new(transport);

        Self {
            connections: ConnectionManager::new(transport.clone(), config.connection_timeout),
            transceiver: Transceiver::new(config.settle_delay),
            transport,
            config,
            current: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs until the session ends on its own.
    pub async fn run(&mut self) -> Result<RunSummary, Error> {
        self.run_until(futures::future::pending::<()>()).await
    }

    /// Runs until the session ends or `shutdown` completes, whichever comes
    /// first. Shutting down disconnects the current device and returns
    /// [`Error::UserInterrupt`].
    pub async fn run_until(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, Error> {
        tokio::pin!(shutdown);

        let result = tokio::select! {
            result = self.session() => result,
            _ = &mut shutdown => Err(Error::UserInterrupt),
        };

        match &result {
            Err(Error::UserInterrupt) => {
                log::info!("Disconnecting.");
                self.teardown().await;
                log::info!("Shutting down.");
            }
            Err(Error::AdapterPoweredDown) => {
                log::error!("Bluetooth interface is powered down.");
                self.teardown().await;
            }
            _ => {
                self.teardown().await;
            }
        }

        result
    }

    async fn session(&mut self) -> Result<RunSummary, Error> {
        let devices = scanner::scan(self.transport.as_ref(), &self.config.scan).await?;
        let candidates = scanner::candidates(&devices, &self.config.scan)
            .cloned()
            .collect::<Vec<_>>();

        let mut summary = RunSummary {
            scanned: devices.len(),
            candidates: candidates.len(),
            devices: Vec::with_capacity(candidates.len()),
        };

        for device in candidates {
            let address = device.address;

            match self.exchange(device).await {
                Ok(()) => {}
                Err(error) if error.scope() == Scope::Run => return Err(error),
                Err(error) => {
                    log::warn!("Skipping {}: {}", address, error);
                    let state = self.teardown().await;
                    summary.devices.push(DeviceReport {
                        address,
                        state,
                        outcome: DeviceOutcome::Skipped(error),
                    });
                    continue;
                }
            }

            self.listen().await?;

            let state = self.teardown().await;
            summary.devices.push(DeviceReport {
                address,
                state,
                outcome: DeviceOutcome::Completed,
            });
        }

        Ok(summary)
    }

    /// Everything between connecting and the listen phase.
    async fn exchange(&mut self, device: DiscoveredDevice) -> Result<(), Error> {
        let Self {
            config,
            connections,
            transceiver,
            current,
            ..
        } = self;
        let connection = current.insert(Connection::new(device));

        connections.connect(connection, config.address_type).await?;

        if let Err(error) = discovery::discover(connection).await {
            log::warn!("Discovery incomplete: {}", error);
            tolerate(config.strictness, error)?;
        }

        let characteristic =
            discovery::resolve(connection, config.service, config.characteristic).ok_or(
                Error::CharacteristicNotFound {
                    service: config.service,
                    characteristic: config.characteristic,
                },
            )?;

        if let Err(error) =
            notification::subscribe(connection, config.service, config.characteristic).await
        {
            log::error!("Error subscribing to characteristic: {}", error);
            tolerate(config.strictness, error)?;
        }

        connection.transition(ConnectionState::Active);

        for payload in &config.payloads {
            if let Err(error) = transceiver.write_command(&characteristic, payload).await {
                if error.scope() != Scope::Call {
                    return Err(fail(connection, error));
                }
            }
        }

        log::info!("Waiting for notifications...");
        let started = Instant::now();
        for _ in 0..config.notification_windows {
            if started.elapsed() >= config.notification_budget {
                break;
            }
            if let Err(error) = connection
                .wait_for_notification(config.notification_window)
                .await
            {
                return Err(fail(connection, error));
            }
        }

        if let Err(error) = transceiver
            .write_request(&characteristic, &config.request)
            .await
        {
            if error.scope() != Scope::Call {
                return Err(fail(connection, error));
            }
        }

        if config.read_response {
            match transceiver.read(&characteristic).await {
                Ok(response) => log::info!("Response: {}", to_hex(&response)),
                Err(error) => return Err(fail(connection, error)),
            }
        }

        Ok(())
    }

    /// Waits for notifications until `listen_for` runs out, or forever.
    async fn listen(&mut self) -> Result<(), Error> {
        let Some(connection) = self.current.as_mut() else {
            return Ok(());
        };

        log::info!("Listening for notifications.");
        let started = Instant::now();

        loop {
            if let Some(limit) = self.config.listen_for {
                if started.elapsed() >= limit {
                    return Ok(());
                }
            }

            connection
                .wait_for_notification(self.config.notification_window)
                .await?;
        }
    }

    /// Disconnects the current device, if any, and returns its final state.
    async fn teardown(&mut self) -> ConnectionState {
        let Some(mut connection) = self.current.take() else {
            return ConnectionState::Idle;
        };

        if connection.state() == ConnectionState::Connecting {
            let abandon = self.transport.abandon(connection.address());
            if tokio::time::timeout(self.config.connection_timeout, abandon)
                .await
                .is_err()
            {
                log::debug!("Abandoning {} timed out.", connection.address());
            }
        }

        connection
            .disconnect(self.config.connection_timeout)
            .await;
        connection.state()
    }
}

/// Passes call-scoped errors in lenient mode, everything else goes up.
fn tolerate(strictness: Strictness, error: Error) -> Result<(), Error> {
    if error.scope() == Scope::Call && strictness == Strictness::Lenient {
        Ok(())
    } else {
        Err(error)
    }
}

/// Marks an active connection as failed.
fn fail<L: crate::Link>(connection: &mut Connection<L>, error: Error) -> Error {
    if connection.state() == ConnectionState::Active {
        connection.transition(ConnectionState::Failed);
    }
    error
}
