use crate::DeviceAddress;
use embedded_hal::i2c::ErrorKind;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors raised by registers, commands, controllers and the bus manager.
///
/// The variants fall into four groups which callers usually treat differently:
///
/// - transport: the bus transfer itself failed ([`Error::Transport`])
/// - validation: the transfer worked but the data is wrong ([`Error::Crc`],
///   [`Error::OutOfRange`], [`Error::InvalidResponse`])
/// - configuration: nothing usable is mounted at an address
/// - lifecycle: mounting failed or the device went away for good
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus transfer with {address} failed: {kind}")]
    Transport {
        address: DeviceAddress,
        kind: ErrorKind,
    },

    #[error("CRC mismatch in word {word}: expected {expected:#04x}, got {actual:#04x}")]
    Crc {
        word: usize,
        expected: u8,
        actual: u8,
    },

    #[error("value {value:#x} does not fit in {bits} bits")]
    OutOfRange { value: u32, bits: u32 },

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("register {offset:#04x} has not been read yet")]
    Stale { offset: u8 },

    #[error("no device configured at {0}")]
    NotConfigured(DeviceAddress),

    #[error("{address} matches several drivers: {candidates:?}")]
    Ambiguous {
        address: DeviceAddress,
        candidates: Vec<&'static str>,
    },

    #[error("no driver named {0:?}")]
    UnknownDriver(String),

    #[error("driver {driver} does not support address {address}")]
    UnsupportedAddress {
        driver: &'static str,
        address: DeviceAddress,
    },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid device address {0:?}")]
    InvalidAddress(String),

    #[error("mounting {driver} failed: {reason}")]
    Mount {
        driver: &'static str,
        #[source]
        reason: Box<Error>,
    },

    #[error("device {0} disconnected")]
    Disconnected(DeviceAddress),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("failed to start background task: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    /// The bus transfer itself failed; retrying right away may succeed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// The transfer succeeded but the data failed a check.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Crc { .. } | Error::OutOfRange { .. } | Error::InvalidResponse(_)
        )
    }

    /// Nothing (or nothing unique) is mounted at the requested address.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::NotConfigured(_)
                | Error::Ambiguous { .. }
                | Error::UnknownDriver(_)
                | Error::UnsupportedAddress { .. }
        )
    }

    pub(crate) fn transport<E: embedded_hal::i2c::Error>(address: DeviceAddress, err: E) -> Self {
        Error::Transport {
            address,
            kind: err.kind(),
        }
    }
}
