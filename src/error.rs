use std::time::Duration;

use btleplug::api::BDAddr;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a [`Transport`](crate::Transport) or [`Link`](crate::Link).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no bluetooth adapter at index {0}")]
    NoAdapter(usize),
    #[error("bluetooth adapter is powered down")]
    PoweredDown,
    #[error("peripheral is not connected")]
    NotConnected,
    #[error(transparent)]
    Btle(#[from] btleplug::Error),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error means the link to the peripheral is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::Btle(btleplug::Error::NotConnected)
        )
    }

    /// Whether the error means the local adapter has lost power.
    ///
    /// The host stacks report this only as free-form text, so runtime errors are
    /// matched on their message.
    pub fn is_powered_down(&self) -> bool {
        match self {
            TransportError::PoweredDown => true,
            TransportError::Btle(btleplug::Error::RuntimeError(message))
            | TransportError::Other(message) => mentions_power_loss(message),
            TransportError::Btle(btleplug::Error::Other(source)) => {
                mentions_power_loss(&source.to_string())
            }
            _ => false,
        }
    }
}

fn mentions_power_loss(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("powered off")
        || message.contains("powered down")
        || message.contains("not powered")
        || message.contains("org.bluez.error.notready")
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Ends the whole run.
    Run,
    /// Ends processing of the current device; the driver moves on.
    Device,
    /// Affects a single call; the flow continues unless strictness says otherwise.
    Call,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bluetooth radio unavailable: {0}")]
    RadioUnavailable(#[source] TransportError),
    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: BDAddr, timeout: Duration },
    #[error("could not connect to {address}: {source}")]
    ConnectFailed {
        address: BDAddr,
        #[source]
        source: TransportError,
    },
    #[error("discovery failed: {0}")]
    DiscoveryFailed(#[source] TransportError),
    #[error("characteristic {characteristic} of service {service} not found")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },
    #[error("characteristic {0} has no descriptors")]
    DescriptorMissing(Uuid),
    #[error("could not enable notifications: {0}")]
    SubscribeFailed(#[source] TransportError),
    #[error("write failed: {0}")]
    WriteFailed(#[source] TransportError),
    #[error("read failed: {0}")]
    ReadFailed(#[source] TransportError),
    #[error("peripheral {0} disconnected")]
    PeripheralDisconnected(BDAddr),
    #[error("bluetooth interface is powered down")]
    AdapterPoweredDown,
    #[error("interrupted by user")]
    UserInterrupt,
}

impl Error {
    /// Classifies a transport error raised while talking to `address`. Power loss
    /// and link loss win over the operation-specific `otherwise` kind.
    pub(crate) fn from_transport(
        address: BDAddr,
        error: TransportError,
        otherwise: impl FnOnce(TransportError) -> Error,
    ) -> Error {
        if error.is_powered_down() {
            Error::AdapterPoweredDown
        } else if error.is_disconnect() {
            Error::PeripheralDisconnected(address)
        } else {
            otherwise(error)
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Error::RadioUnavailable(_) | Error::AdapterPoweredDown | Error::UserInterrupt => {
                Scope::Run
            }
            Error::ConnectTimeout { .. }
            | Error::ConnectFailed { .. }
            | Error::CharacteristicNotFound { .. }
            | Error::PeripheralDisconnected(_)
            | Error::ReadFailed(_) => Scope::Device,
            Error::DiscoveryFailed(_)
            | Error::DescriptorMissing(_)
            | Error::SubscribeFailed(_)
            | Error::WriteFailed(_) => Scope::Call,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::UserInterrupt => ExitStatus::Interrupted,
            Error::PeripheralDisconnected(_) => ExitStatus::PeripheralDisconnected,
            Error::AdapterPoweredDown => ExitStatus::AdapterPoweredDown,
            Error::RadioUnavailable(source) if source.is_powered_down() => {
                ExitStatus::AdapterPoweredDown
            }
            _ => ExitStatus::Failure,
        }
    }
}

/// Process exit codes of the `ble-session` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    Interrupted = 1,
    PeripheralDisconnected = 2,
    AdapterPoweredDown = 3,
    Failure = 4,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl<T> From<&Result<T, Error>> for ExitStatus {
    fn from(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => ExitStatus::Success,
            Err(error) => error.exit_status(),
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}
