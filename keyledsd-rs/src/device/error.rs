/* Error taxonomy for the HID++ protocol client.
 *
 * Protocol errors (reported by the device in an error frame) are kept apart
 * from transport errors (I/O on the hidraw node) because recovery differs:
 * protocol errors never take a device offline, transport errors are split
 * into recoverable and terminal by errno. */

use nix::errno::Errno;
use thiserror::Error;

use crate::hid::endpoint::CommandError;

/* HID++ 2.0 feature-call error codes. Wire values are bit-exact; byte 5 of a
 * response frame whose feature index is 0xff. */
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HidppError {
    #[error("unknown error")]
    Unknown,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of range")]
    OutOfRange,
    #[error("hardware error")]
    HardwareError,
    #[error("internal error")]
    Internal,
    #[error("invalid feature index")]
    InvalidFeatureIndex,
    #[error("invalid function id")]
    InvalidFunctionId,
    #[error("device busy")]
    Busy,
    #[error("unsupported")]
    Unsupported,
    #[error("unexpected error code 0x{0:02x}")]
    Other(u8),
}

impl HidppError {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Unknown,
            2 => Self::InvalidArgument,
            3 => Self::OutOfRange,
            4 => Self::HardwareError,
            5 => Self::Internal,
            6 => Self::InvalidFeatureIndex,
            7 => Self::InvalidFunctionId,
            8 => Self::Busy,
            9 => Self::Unsupported,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 1,
            Self::InvalidArgument => 2,
            Self::OutOfRange => 3,
            Self::HardwareError => 4,
            Self::Internal => 5,
            Self::InvalidFeatureIndex => 6,
            Self::InvalidFunctionId => 7,
            Self::Busy => 8,
            Self::Unsupported => 9,
            Self::Other(code) => *code,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed report descriptor: {0}")]
    Descriptor(#[from] crate::hid::parser::ParseError),

    #[error("no report usable for feature calls")]
    NoReport,

    #[error("device speaks HID++ version {version}, version 2 required")]
    UnsupportedProtocol { version: u8 },

    #[error("device error: {0}")]
    Hidpp(#[from] HidppError),

    #[error("feature 0x{feature_id:04x} not present on device")]
    FeatureNotFound { feature_id: u16 },

    #[error("payload of {size} bytes exceeds largest device report")]
    PayloadTooLarge { size: usize },

    #[error("command timed out")]
    Timeout,

    #[error("command queue full")]
    QueueFull,

    #[error("I/O error: {0}")]
    Io(Errno),

    #[error("malformed or mismatched response")]
    BadResponse,
}

impl DeviceError {
    /* Transient transport failures worth the retry-and-resync dance. */
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(Errno::EIO) | Self::Io(Errno::EINTR))
    }

    /* Device-reported errors: surfaced to the caller, never fatal. */
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Hidpp(_) | Self::FeatureNotFound { .. } | Self::BadResponse
        )
    }
}

impl From<CommandError> for DeviceError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout => Self::Timeout,
            CommandError::Cancelled => Self::Io(Errno::ECANCELED),
            CommandError::QueueFull => Self::QueueFull,
            CommandError::Send(errno) | CommandError::Receive(errno) => Self::Io(errno),
        }
    }
}
