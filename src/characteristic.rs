use std::sync::{Arc, Weak};
use std::time::Duration;

use btleplug::api::{BDAddr, WriteType};
use uuid::Uuid;

use crate::device::to_hex;
use crate::service::CharacteristicInfo;
use crate::{Error, Link};

/// A resolved characteristic on a live link.
///
/// Holds the link weakly: once the connection is torn down the handle stops
/// working, so it must be resolved again after a reconnect.
pub struct CharacteristicHandle<L> {
    pub(crate) address: BDAddr,
    pub(crate) info: CharacteristicInfo,
    pub(crate) link: Weak<L>,
}

impl<L> Clone for CharacteristicHandle<L> {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            info: self.info.clone(),
            link: self.link.clone(),
        }
    }
}

impl<L: Link> CharacteristicHandle<L> {
    pub(crate) fn new(info: CharacteristicInfo, link: &Arc<L>) -> Self {
        Self {
            address: link.address(),
            info,
            link: Arc::downgrade(link),
        }
    }

    pub fn service_uuid(&self) -> Uuid {
        self.info.service_uuid
    }

    pub fn uuid(&self) -> Uuid {
        self.info.uuid
    }

    pub fn handle(&self) -> u16 {
        self.info.handle
    }

    pub fn info(&self) -> &CharacteristicInfo {
        &self.info
    }

    fn link(&self) -> Result<Arc<L>, Error> {
        self.link
            .upgrade()
            .ok_or(Error::PeripheralDisconnected(self.address))
    }
}

/// Writes to and reads from resolved characteristics.
#[derive(Debug, Clone)]
pub struct Transceiver {
    settle_delay: Duration,
}

impl Transceiver {
    /// `settle_delay` is slept after every write, failed or not. Some
    /// peripherals drop data that arrives while they commit the previous write.
    pub fn new(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }

    /// Acknowledged write
    pub async fn write_request<L: Link>(
        &self,
        characteristic: &CharacteristicHandle<L>,
        data: &[u8],
    ) -> Result<(), Error> {
        self.write(characteristic, data, WriteType::WithResponse).await
    }

    /// Fire-and-forget write
    pub async fn write_command<L: Link>(
        &self,
        characteristic: &CharacteristicHandle<L>,
        data: &[u8],
    ) -> Result<(), Error> {
        self.write(characteristic, data, WriteType::WithoutResponse).await
    }

    pub async fn write<L: Link>(
        &self,
        characteristic: &CharacteristicHandle<L>,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), Error> {
        log::info!("Writing data to handle 0x{:04x}.", characteristic.handle());
        log::debug!("Payload {} ({:?})", to_hex(data), write_type);

        let result = match characteristic.link() {
            Ok(link) => link
                .write(&characteristic.info, data, write_type)
                .await
                .map_err(|error| {
                    Error::from_transport(characteristic.address, error, Error::WriteFailed)
                }),
            Err(error) => Err(error),
        };

        if let Err(error) = &result {
            log::error!("Error on writing: {}", error);
        }

        tokio::time::sleep(self.settle_delay).await;

        result
    }

    pub async fn read<L: Link>(
        &self,
        characteristic: &CharacteristicHandle<L>,
    ) -> Result<Vec<u8>, Error> {
        log::info!("Reading data from handle 0x{:04x}.", characteristic.handle());

        let link = characteristic.link()?;
        match link.read(&characteristic.info).await {
            Ok(data) => {
                log::info!(
                    "Read from handle 0x{:04x}: {}",
                    characteristic.handle(),
                    to_hex(&data)
                );
                Ok(data)
            }
            Err(error) => {
                let error = Error::from_transport(characteristic.address, error, Error::ReadFailed);
                log::error!("Error on reading: {}", error);
                Err(error)
            }
        }
    }
}
