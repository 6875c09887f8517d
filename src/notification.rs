use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::common::descriptors::ENABLE_NOTIFICATION;
use crate::connection::ConnectionState;
use crate::device::to_hex;
use crate::discovery::resolve;
use crate::{Connection, Error, Link};

/// Log target of received notifications, kept apart from the module's
/// progress messages so it can be shown on its own.
pub const NOTIFICATION_TARGET: &str = "blesession::notifications";

/// A value pushed by the peripheral without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub handle: u16,
    pub payload: Vec<u8>,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle {:04x}: {}", self.handle, to_hex(&self.payload))
    }
}

/// Turns on notifications for a characteristic and installs the connection's
/// notification sink.
///
/// The enable value goes to the first descriptor of the characteristic. From
/// then on every notification on the link is queued for
/// [`Connection::wait_for_notification`], replacing any earlier sink.
pub async fn subscribe<L: Link>(
    connection: &mut Connection<L>,
    service: Uuid,
    characteristic: Uuid,
) -> Result<(), Error> {
    let address = connection.address();
    let handle = resolve(connection, service, characteristic).ok_or(
        Error::CharacteristicNotFound {
            service,
            characteristic,
        },
    )?;
    let descriptor = handle
        .info()
        .descriptors
        .first()
        .copied()
        .ok_or(Error::DescriptorMissing(characteristic))?;
    let link = match connection.link() {
        Some(link) => link.clone(),
        None => return Err(Error::PeripheralDisconnected(address)),
    };

    log::info!("Trying to subscribe to characteristic.");

    link.write_descriptor(handle.info(), &descriptor, &ENABLE_NOTIFICATION)
        .await
        .map_err(|error| Error::from_transport(address, error, Error::SubscribeFailed))?;
    let notifications = link
        .notifications()
        .await
        .map_err(|error| Error::from_transport(address, error, Error::SubscribeFailed))?;

    connection.notifications = Some(notifications);
    connection.transition(ConnectionState::Subscribed);
    log::info!("Subscribed to characteristic.");

    Ok(())
}

impl<L: Link> Connection<L> {
    /// Waits up to `window` for the next notification and logs it.
    ///
    /// Returns `Ok(None)` when the window passes quietly. A quiet window is
    /// followed by a liveness check, so a peripheral that went away is reported
    /// here as [`Error::PeripheralDisconnected`] and an adapter that lost power
    /// as [`Error::AdapterPoweredDown`].
    pub async fn wait_for_notification(
        &mut self,
        window: Duration,
    ) -> Result<Option<NotificationEvent>, Error> {
        let started = Instant::now();

        if let Some(notifications) = self.notifications.as_mut() {
            match tokio::time::timeout(window, notifications.next()).await {
                Ok(Some(event)) => {
                    log::info!(target: NOTIFICATION_TARGET, "Notification from {}", event);
                    return Ok(Some(event));
                }
                Ok(None) => {
                    log::debug!("Notification stream of {} ended.", self.address());
                    self.notifications = None;
                }
                Err(_) => {}
            }
        }

        let remaining = window.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }

        self.ensure_alive().await?;
        Ok(None)
    }
}
