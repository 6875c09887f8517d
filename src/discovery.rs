use uuid::Uuid;

use crate::connection::ConnectionState;
use crate::error::Scope;
use crate::{CharacteristicHandle, Connection, Error, Link};

/// Discovers services, characteristics and descriptors and caches them on the
/// connection.
///
/// Some peripherals answer lookups only after a full discovery pass, others
/// never finish one, so callers normally log a [`Error::DiscoveryFailed`] and
/// carry on; lookups then fail on their own.
pub async fn discover<L: Link>(connection: &mut Connection<L>) -> Result<(), Error> {
    let address = connection.address();
    let link = match connection.link() {
        Some(link) => link.clone(),
        None => return Err(Error::PeripheralDisconnected(address)),
    };

    connection.transition(ConnectionState::Discovering);

    match link.discover().await {
        Ok(services) => {
            let characteristic_count = services
                .iter()
                .map(|service| service.characteristics.len())
                .sum::<usize>();
            log::debug!(
                "Discovered {} services and {} characteristics on {}.",
                services.len(),
                characteristic_count,
                address
            );

            connection.services = services;
            connection.transition(ConnectionState::Connected);
            Ok(())
        }
        Err(error) => {
            let error = Error::from_transport(address, error, Error::DiscoveryFailed);
            if error.scope() == Scope::Call {
                connection.transition(ConnectionState::Connected);
            } else {
                connection.transition(ConnectionState::Failed);
            }
            Err(error)
        }
    }
}

/// Finds a characteristic in the services cached by [`discover`].
///
/// The first service with `service` as UUID is searched for the first
/// characteristic with `characteristic` as UUID. `None` is the normal answer
/// for devices that do not implement the service.
pub fn resolve<L: Link>(
    connection: &Connection<L>,
    service: Uuid,
    characteristic: Uuid,
) -> Option<CharacteristicHandle<L>> {
    log::info!(
        "Searching for service/characteristic:\n    {}\n    {}",
        service,
        characteristic
    );

    let link = connection.link()?;
    let found = connection
        .services()
        .iter()
        .find(|candidate| candidate.uuid == service)
        .and_then(|service| service.characteristic(characteristic));

    match found {
        Some(info) => {
            log::info!("Characteristic found.");
            Some(CharacteristicHandle::new(info.clone(), link))
        }
        None => {
            log::warn!("Service or characteristic not found.");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{characteristics::TARGET_CHARACTERISTIC, services::TARGET_SERVICE};
    use crate::mock::{MockPeripheral, MockTransport};
    use crate::{ConnectionManager, DiscoveredDevice};
    use btleplug::api::bleuuid::uuid_from_u16;
    use btleplug::api::{AddressType, BDAddr};
    use std::sync::Arc;
    use std::time::Duration;

    async fn connect(peripheral: MockPeripheral) -> Connection<crate::mock::MockLink> {
        let device = peripheral.device().clone();
        let transport = MockTransport::new().with_peripheral(peripheral);
        let manager = ConnectionManager::new(Arc::new(transport), Duration::from_secs(5));
        let mut connection = Connection::new(device);
        manager
            .connect(&mut connection, AddressType::Public)
            .await
            .unwrap();
        connection
    }

    fn device() -> DiscoveredDevice {
        DiscoveredDevice::new(BDAddr::from([7; 6]), AddressType::Public, -45)
    }

    #[tokio::test]
    async fn discovery_populates_the_cache() {
        let mut connection = connect(MockPeripheral::new(device())).await;

        discover(&mut connection).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.services().len(), 1);
        let handle = resolve(&connection, TARGET_SERVICE, TARGET_CHARACTERISTIC).unwrap();
        assert_eq!(handle.uuid(), TARGET_CHARACTERISTIC);
        assert_eq!(handle.service_uuid(), TARGET_SERVICE);
    }

    #[tokio::test]
    async fn failed_discovery_is_soft() {
        let mut connection = connect(MockPeripheral::new(device()).failing_discovery()).await;

        let error = discover(&mut connection).await.unwrap_err();

        assert!(matches!(error, Error::DiscoveryFailed(_)));
        assert_eq!(error.scope(), Scope::Call);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(resolve(&connection, TARGET_SERVICE, TARGET_CHARACTERISTIC).is_none());
    }

    #[tokio::test]
    async fn missing_service_or_characteristic_is_none() {
        let mut connection = connect(MockPeripheral::new(device())).await;
        discover(&mut connection).await.unwrap();

        assert!(resolve(&connection, uuid_from_u16(0xfff0), TARGET_CHARACTERISTIC).is_none());
        assert!(resolve(&connection, TARGET_SERVICE, uuid_from_u16(0xfff1)).is_none());
    }

    #[tokio::test]
    async fn nothing_resolves_without_a_link() {
        let mut connection = connect(MockPeripheral::new(device())).await;
        discover(&mut connection).await.unwrap();
        connection.disconnect(Duration::from_secs(1)).await;

        assert!(resolve(&connection, TARGET_SERVICE, TARGET_CHARACTERISTIC).is_none());
    }
}
