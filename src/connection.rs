use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{AddressType, BDAddr};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::service::Service;
use crate::transport::NotificationStream;
use crate::{DiscoveredDevice, Error, Link, Transport, TransportError};

/// How long cleanup after a timed-out connection attempt may take.
const ABANDON_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Discovering,
    Subscribed,
    Active,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Failed, _) | (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Idle, Connecting) => true,
            (Connecting, Connected) | (Connecting, Failed) => true,
            (Connected, Discovering) | (Connected, Subscribed) | (Connected, Active) => true,
            (Discovering, Connected) | (Discovering, Failed) => true,
            (Subscribed, Active) => true,
            (Active, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// One link to one device, from the connection attempt to teardown.
pub struct Connection<L> {
    device: DiscoveredDevice,
    state: ConnectionState,
    link: Option<Arc<L>>,
    pub(crate) services: Vec<Service>,
    pub(crate) notifications: Option<NotificationStream>,
}

impl<L: Link> Connection<L> {
    pub fn new(device: DiscoveredDevice) -> Self {
        Self {
            device,
            state: ConnectionState::Idle,
            link: None,
            services: Vec::new(),
            notifications: None,
        }
    }

    #[inline]
    pub fn address(&self) -> BDAddr {
        self.device.address
    }

    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Services found by the last discovery
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn is_subscribed(&self) -> bool {
        self.notifications.is_some()
    }

    pub(crate) fn link(&self) -> Option<&Arc<L>> {
        self.link.as_ref()
    }

    /// Moves to `next` if the state machine allows it. Returns whether it did.
    pub(crate) fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "{}: ignoring transition {:?} -> {:?}",
                self.address(),
                self.state,
                next
            );
            return false;
        }

        log::trace!("{}: {:?} -> {:?}", self.address(), self.state, next);
        self.state = next;
        true
    }

    /// Whether the peripheral is still there. Any doubt counts as gone.
    pub async fn is_alive(&self) -> bool {
        self.ensure_alive().await.is_ok()
    }

    /// Fails with [`Error::PeripheralDisconnected`] once the link is gone. An
    /// adapter that lost power while being asked is [`Error::AdapterPoweredDown`].
    pub async fn ensure_alive(&self) -> Result<(), Error> {
        let address = self.address();
        let link = self
            .link
            .as_ref()
            .ok_or(Error::PeripheralDisconnected(address))?;

        match link.is_connected().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::PeripheralDisconnected(address)),
            Err(error) => Err(Error::from_transport(address, error, |_| {
                Error::PeripheralDisconnected(address)
            })),
        }
    }

    /// Tears the link down. Errors are logged and swallowed, and the call gives
    /// up waiting after `grace`.
    pub async fn disconnect(&mut self, grace: Duration) {
        self.notifications = None;
        self.services.clear();

        if let Some(link) = self.link.take() {
            match tokio::time::timeout(grace, link.disconnect()).await {
                Ok(Ok(())) => log::debug!("Disconnected from {}.", self.address()),
                Ok(Err(error)) => log::debug!("Disconnecting {} failed: {}", self.address(), error),
                Err(_) => log::debug!("Disconnecting {} timed out.", self.address()),
            }
        }

        if !self.state.is_terminal() {
            self.transition(ConnectionState::Disconnected);
        }
    }
}

/// Aborts the background connection attempt when dropped.
struct ConnectAttempt(JoinHandle<()>);

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Opens links under a hard timeout.
pub struct ConnectionManager<T> {
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connects `connection` to its device.
    ///
    /// The transport call runs as a separate task whose result comes back over
    /// a oneshot channel. If nothing arrives within the timeout the task is
    /// aborted and the transport is asked to abandon the half-open link. On
    /// failure the connection ends up `Failed`.
    pub async fn connect(
        &self,
        connection: &mut Connection<T::Link>,
        address_type: AddressType,
    ) -> Result<(), Error> {
        let address = connection.address();
        if !connection.transition(ConnectionState::Connecting) {
            return Err(Error::ConnectFailed {
                address,
                source: TransportError::Other(format!(
                    "connection is {:?}",
                    connection.state()
                )),
            });
        }

        log::info!("Connecting to {}.", address);

        let (sender, receiver) = oneshot::channel();
        let transport = Arc::clone(&self.transport);
        let attempt = ConnectAttempt(tokio::spawn(async move {
            let result = transport.connect(address, address_type).await;
            if let Err(Ok(link)) = sender.send(result) {
                link.disconnect().await.ok();
            }
        }));

        let result = match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(link))) => Ok(link),
            Ok(Ok(Err(error))) if error.is_powered_down() => Err(Error::AdapterPoweredDown),
            Ok(Ok(Err(source))) => Err(Error::ConnectFailed { address, source }),
            Ok(Err(_)) => Err(Error::ConnectFailed {
                address,
                source: TransportError::Other("connection attempt ended without a result".into()),
            }),
            Err(_) => {
                drop(attempt);
                if tokio::time::timeout(ABANDON_GRACE, self.transport.abandon(address))
                    .await
                    .is_err()
                {
                    log::debug!("Abandoning {} timed out.", address);
                }
                Err(Error::ConnectTimeout {
                    address,
                    timeout: self.timeout,
                })
            }
        };

        match result {
            Ok(link) => {
                connection.link = Some(Arc::new(link));
                connection.transition(ConnectionState::Connected);
                log::info!("Connected to {}.", address);
                Ok(())
            }
            Err(error) => {
                connection.transition(ConnectionState::Failed);
                log::error!("Could not connect: {}", error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ConnectBehavior, MockPeripheral, MockTransport, Operation};
    use tokio::time::Instant;
    use ConnectionState::*;

    fn device() -> DiscoveredDevice {
        DiscoveredDevice::new(BDAddr::from([0xaa; 6]), AddressType::Public, -50)
    }

    fn manager(transport: &MockTransport) -> ConnectionManager<MockTransport> {
        ConnectionManager::new(Arc::new(transport.clone()), Duration::from_secs(5))
    }

    #[test]
    fn state_machine_edges() {
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Discovering));
        assert!(Discovering.can_transition_to(Connected));
        assert!(Discovering.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Subscribed));
        assert!(Subscribed.can_transition_to(Active));
        assert!(Active.can_transition_to(Failed));
        assert!(Active.can_transition_to(Disconnected));
        assert!(Idle.can_transition_to(Disconnected));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Failed));
        assert!(!Subscribed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Disconnected));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn successful_connect_ends_connected() {
        let transport = MockTransport::new().with_peripheral(MockPeripheral::new(device()));
        let mut connection = Connection::new(device());

        manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await
            .unwrap();

        assert_eq!(connection.state(), Connected);
        assert!(connection.is_alive().await);
    }

    #[tokio::test]
    async fn refused_connect_fails_the_connection() {
        let transport = MockTransport::new()
            .with_peripheral(MockPeripheral::new(device()).connect_behavior(ConnectBehavior::Fail));
        let mut connection = Connection::new(device());

        let result = manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await;

        assert!(matches!(result, Err(Error::ConnectFailed { .. })));
        assert_eq!(connection.state(), Failed);
        assert!(!connection.is_alive().await);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_is_abandoned_at_the_deadline() {
        let transport = MockTransport::new()
            .with_peripheral(MockPeripheral::new(device()).connect_behavior(ConnectBehavior::Hang));
        let mut connection = Connection::new(device());

        let started = Instant::now();
        let result = manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::ConnectTimeout { .. })));
        assert_eq!(connection.state(), Failed);
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(5) + ABANDON_GRACE + Duration::from_millis(10));
        assert!(transport
            .operations()
            .contains(&Operation::Abandon(device().address)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_within_the_deadline_succeeds() {
        let transport = MockTransport::new().with_peripheral(
            MockPeripheral::new(device())
                .connect_behavior(ConnectBehavior::Delay(Duration::from_secs(4))),
        );
        let mut connection = Connection::new(device());

        manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await
            .unwrap();

        assert_eq!(connection.state(), Connected);
    }

    #[tokio::test]
    async fn powered_down_adapter_escalates() {
        let transport = MockTransport::new().with_peripheral(
            MockPeripheral::new(device()).connect_behavior(ConnectBehavior::PoweredDown),
        );
        let mut connection = Connection::new(device());

        let result = manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await;

        assert!(matches!(result, Err(Error::AdapterPoweredDown)));
    }

    #[tokio::test]
    async fn liveness_tells_power_loss_from_link_loss() {
        let transport = MockTransport::new().with_peripheral(MockPeripheral::new(device()));
        let mut connection = Connection::new(device());
        manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await
            .unwrap();
        assert!(connection.ensure_alive().await.is_ok());

        transport.drop_link(device().address);
        assert!(matches!(
            connection.ensure_alive().await,
            Err(Error::PeripheralDisconnected(_))
        ));

        transport.power_down();
        assert!(matches!(
            connection.ensure_alive().await,
            Err(Error::AdapterPoweredDown)
        ));
        assert!(!connection.is_alive().await);
    }

    #[tokio::test]
    async fn disconnect_is_best_effort_and_final() {
        let transport = MockTransport::new().with_peripheral(MockPeripheral::new(device()));
        let mut connection = Connection::new(device());
        manager(&transport)
            .connect(&mut connection, AddressType::Public)
            .await
            .unwrap();

        connection.disconnect(Duration::from_secs(1)).await;
        connection.disconnect(Duration::from_secs(1)).await;

        assert_eq!(connection.state(), Disconnected);
        assert!(connection.link().is_none());
        let disconnects = transport
            .operations()
            .into_iter()
            .filter(|operation| matches!(operation, Operation::Disconnect(_)))
            .count();
        assert_eq!(disconnects, 1);
    }
}
