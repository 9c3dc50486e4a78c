//! Maps raw transport/device failures to [`BridgeError`] kinds.

use std::fmt;

use crate::error::BridgeError;

/// U2F client error code for "timeout" (see the FIDO U2F JavaScript API).
pub const U2F_TIMEOUT_CODE: u32 = 5;

/// Status words the device answers with when it is locked.
pub const LOCKED_STATUS: &[u16] = &[0x6804, 0x6801, 0x5515];

/// Status words that mean the expected application is not the one running.
pub const WRONG_APP_STATUS: &[u16] = &[0x6700, 0x6e00];

const GESTURE_ERRORS: &[&str] = &["TransportWebUSBGestureRequired", "TransportOpenUserCancelled"];

/// Failure shapes a transport or device app can produce before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A named exception, e.g. `TransportWebUSBGestureRequired`.
    Named { name: String, message: String },
    /// The device answered with a non-success status word.
    Status { code: u16, message: String },
    /// A legacy U2F failure carrying client metadata.
    U2f { code: u32, kind: String },
    /// An error object with an `id` field, as older transports emit.
    Identified { id: String, message: String },
    /// A bare string thrown by a transport.
    Text(String),
}

impl DeviceError {
    /// Status error with the message device transports use:
    /// `Ledger device: <reason> (0x6985)`.
    pub fn status(code: u16) -> Self {
        Self::Status {
            code,
            message: format!("Ledger device: {} (0x{code:04x})", status_reason(code)),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Named { message, .. }
            | Self::Status { message, .. }
            | Self::Identified { message, .. } => message.clone(),
            Self::U2f { kind, .. } => kind.clone(),
            Self::Text(text) => text.clone(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { name, message } => write!(f, "{name}: {message}"),
            Self::Status { message, .. } => write!(f, "{message}"),
            Self::U2f { code, kind } => write!(f, "U2F {kind} (code {code})"),
            Self::Identified { id, message } => write!(f, "{id}: {message}"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

impl std::error::Error for DeviceError {}

fn status_reason(code: u16) -> &'static str {
    match code {
        0x6700 => "INCORRECT_LENGTH",
        0x6801 | 0x6804 => "SECURITY_STATUS_NOT_SATISFIED",
        0x5515 => "LOCKED_DEVICE",
        0x6982 => "SECURITY_STATUS_NOT_SATISFIED",
        0x6985 => "CONDITIONS_OF_USE_NOT_SATISFIED",
        0x6a80 => "INCORRECT_DATA",
        0x6b00 => "INCORRECT_P1_P2",
        0x6d00 => "INS_NOT_SUPPORTED",
        0x6e00 => "CLA_NOT_SUPPORTED",
        _ => "UNKNOWN_ERROR",
    }
}

fn requires_gesture(err: &DeviceError) -> bool {
    match err {
        DeviceError::Named { name, .. } => GESTURE_ERRORS.contains(&name.as_str()),
        DeviceError::Text(text) => GESTURE_ERRORS.contains(&text.as_str()),
        _ => false,
    }
}

fn is_locked(err: &DeviceError) -> bool {
    if let DeviceError::Status { code, .. } = err {
        if LOCKED_STATUS.contains(code) {
            return true;
        }
    }
    let message = err.message();
    if message.contains("OpenFailed") || message.contains("0x6804") || message.contains("0x5515")
    {
        return true;
    }
    matches!(err, DeviceError::Text(text) if text.contains("6801"))
}

fn is_wrong_app(err: &DeviceError) -> bool {
    if let DeviceError::Status { code, .. } = err {
        return WRONG_APP_STATUS.contains(code);
    }
    let message = err.message();
    message.contains("0x6700") || message.contains("0x6e00")
}

fn is_transport_unsupported(err: &DeviceError) -> bool {
    matches!(err, DeviceError::Identified { message, .. } if message.contains("U2F not supported"))
}

/// Classify a raw device failure. First match wins:
/// gesture/permission, locked, wrong app, U2F metadata, unsupported transport.
///
/// Locked is checked before wrong-app because older firmwares answer 0x6804
/// for a locked device, and the string checks below would otherwise be able
/// to match more than one kind.
pub fn classify(err: &DeviceError) -> BridgeError {
    if requires_gesture(err) {
        return BridgeError::NeedUsbPermission;
    }
    if is_locked(err) {
        return BridgeError::Locked;
    }
    if is_wrong_app(err) {
        return BridgeError::WrongApp;
    }
    if let DeviceError::U2f { code, kind } = err {
        if *code == U2F_TIMEOUT_CODE {
            return BridgeError::Timeout;
        }
        return BridgeError::Other(kind.clone());
    }
    if is_transport_unsupported(err) {
        return BridgeError::U2fNotSupported;
    }
    BridgeError::Other(err.to_string())
}

impl From<DeviceError> for BridgeError {
    fn from(err: DeviceError) -> Self {
        classify(&err)
    }
}
