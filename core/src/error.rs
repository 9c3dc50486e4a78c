//! Domain error type for bridge operations.

use thiserror::Error;

/// Classified bridge failure. Raw transport errors never cross the session
/// boundary; they are turned into one of these variants by
/// [`classify`](crate::classify::classify) first.
///
/// `Display` renders the stable code for device-level kinds so the value can
/// be posted across the frame boundary as a plain string and parsed back with
/// [`BridgeError::from_code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The browser/host needs a user gesture or the user cancelled the picker.
    #[error("LEDGER_NEED_USB_PERMISSION")]
    NeedUsbPermission,

    /// A different application (or the dashboard) is open on the device.
    #[error("LEDGER_WRONG_APP")]
    WrongApp,

    /// The device is PIN-locked or could not be opened.
    #[error("LEDGER_LOCKED")]
    Locked,

    /// The legacy U2F transport is not available in this environment.
    #[error("U2F_NOT_SUPPORTED")]
    U2fNotSupported,

    /// The device or the bridge frame did not answer in time.
    #[error("LEDGER_TIMEOUT")]
    Timeout,

    /// Signing by address found no matching index in the search space.
    #[error("UnknownAddressError: {0}")]
    UnknownAddress(String),

    /// A derivation path could not be parsed or is too short.
    #[error("InvalidPathError: {0}")]
    InvalidPath(String),

    /// The device signature recovers to a different address than requested.
    #[error("SignatureMismatchError: expected {expected}, recovered {recovered}")]
    SignatureMismatch { expected: String, recovered: String },

    /// A proxied request is already outstanding on this adapter.
    #[error("BridgeBusyError: {0}")]
    Busy(String),

    /// The outstanding request was cancelled by the caller.
    #[error("CancelledError")]
    Cancelled,

    /// The cross-context channel is gone.
    #[error("BridgeClosedError")]
    ChannelClosed,

    /// An operation was attempted without an open device session.
    #[error("NoSessionError")]
    NoSession,

    /// Malformed envelope, payload or device answer.
    #[error("ProtocolError: {0}")]
    Protocol(String),

    /// The chain family does not offer this operation.
    #[error("UnsupportedError: {0}")]
    Unsupported(String),

    /// Anything the classifier could not match; carries the original message.
    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Stable application-facing code.
    pub fn code(&self) -> &str {
        match self {
            Self::NeedUsbPermission => "LEDGER_NEED_USB_PERMISSION",
            Self::WrongApp => "LEDGER_WRONG_APP",
            Self::Locked => "LEDGER_LOCKED",
            Self::U2fNotSupported => "U2F_NOT_SUPPORTED",
            Self::Timeout => "LEDGER_TIMEOUT",
            Self::UnknownAddress(_) => "UnknownAddressError",
            Self::InvalidPath(_) => "InvalidPathError",
            Self::SignatureMismatch { .. } => "SignatureMismatchError",
            Self::Busy(_) => "BridgeBusyError",
            Self::Cancelled => "CancelledError",
            Self::ChannelClosed => "BridgeClosedError",
            Self::NoSession => "NoSessionError",
            Self::Protocol(_) => "ProtocolError",
            Self::Unsupported(_) => "UnsupportedError",
            Self::Other(message) => message,
        }
    }

    /// Rebuild an error from the string a responder posted in `payload.error`.
    /// Anything unrecognised comes back as [`BridgeError::Other`].
    pub fn from_code(raw: &str) -> Self {
        match raw {
            "LEDGER_NEED_USB_PERMISSION" => return Self::NeedUsbPermission,
            "LEDGER_WRONG_APP" => return Self::WrongApp,
            "LEDGER_LOCKED" => return Self::Locked,
            "U2F_NOT_SUPPORTED" => return Self::U2fNotSupported,
            "LEDGER_TIMEOUT" => return Self::Timeout,
            "CancelledError" => return Self::Cancelled,
            "BridgeClosedError" => return Self::ChannelClosed,
            "NoSessionError" => return Self::NoSession,
            _ => {}
        }

        let detail = |prefix: &str| {
            raw.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix(": "))
                .map(str::to_string)
        };
        if let Some(d) = detail("UnknownAddressError") {
            return Self::UnknownAddress(d);
        }
        if let Some(d) = detail("InvalidPathError") {
            return Self::InvalidPath(d);
        }
        if let Some(d) = detail("BridgeBusyError") {
            return Self::Busy(d);
        }
        if let Some(d) = detail("ProtocolError") {
            return Self::Protocol(d);
        }
        if let Some(d) = detail("UnsupportedError") {
            return Self::Unsupported(d);
        }
        if let Some(d) = detail("SignatureMismatchError") {
            if let Some((expected, recovered)) = d
                .strip_prefix("expected ")
                .and_then(|rest| rest.split_once(", recovered "))
            {
                return Self::SignatureMismatch {
                    expected: expected.to_string(),
                    recovered: recovered.to_string(),
                };
            }
        }
        Self::Other(raw.to_string())
    }
}

/// Alias for `std::result::Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;
