//! Error types for camera transport, session and enumeration operations.

use super::types::Capability;

/// Errors reported by a transport while probing or talking to a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Camera not found (may have been unplugged).
    DeviceNotFound { device_id: String },
    /// Camera session is not open.
    NotConnected { device_id: String },
    /// Another process has exclusive access to the camera.
    ExclusiveAccess {
        device_id: String,
        blocking_process: Option<String>,
    },
    Timeout { device_id: String },
    /// Camera was disconnected unexpectedly.
    Disconnected { device_id: String },
    /// Protocol error from camera.
    Protocol { device_id: String, message: String },
    DeviceBusy { device_id: String },
    /// The transport can't perform this operation on this camera.
    Unsupported { device_id: String, operation: String },
    Other { device_id: String, message: String },
}

impl TransportError {
    /// Returns true if the camera connection can't be used after this error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::NotConnected { .. })
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceNotFound { .. } => "Camera not found. It may have been unplugged.".to_string(),
            Self::NotConnected { .. } => "Camera is not connected. Reconnect it and reload.".to_string(),
            Self::ExclusiveAccess { blocking_process, .. } => {
                if let Some(proc) = blocking_process {
                    format!("Another app ({}) is using the camera. Close it and reload.", proc)
                } else {
                    "Another app is using the camera. Close other apps that might be accessing it.".to_string()
                }
            }
            Self::Timeout { .. } => "The camera didn't respond in time. Try again.".to_string(),
            Self::Disconnected { .. } => "Camera was disconnected. Reconnect it to continue.".to_string(),
            Self::Protocol { message, .. } => format!("Camera reported an error: {}.", message),
            Self::DeviceBusy { .. } => "Camera is busy. Wait a moment and try again.".to_string(),
            Self::Unsupported { operation, .. } => format!("This camera doesn't support {}.", operation),
            Self::Other { message, .. } => message.clone(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceNotFound { device_id } => write!(f, "Camera not found: {device_id}"),
            Self::NotConnected { device_id } => write!(f, "Camera not connected: {device_id}"),
            Self::ExclusiveAccess {
                device_id,
                blocking_process,
            } => {
                if let Some(proc) = blocking_process {
                    write!(f, "Camera {device_id} is in use by {proc}")
                } else {
                    write!(f, "Camera {device_id} is in use by another process")
                }
            }
            Self::Timeout { device_id } => write!(f, "Timed out talking to camera: {device_id}"),
            Self::Disconnected { device_id } => write!(f, "Camera disconnected: {device_id}"),
            Self::Protocol { device_id, message } => write!(f, "Protocol error for {device_id}: {message}"),
            Self::DeviceBusy { device_id } => write!(f, "Camera busy: {device_id}"),
            Self::Unsupported { device_id, operation } => {
                write!(f, "Operation {operation} not supported by {device_id}")
            }
            Self::Other { device_id, message } => write!(f, "Error for {device_id}: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors from the storage enumerator. Enumeration failures never stop the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumerationError {
    /// No device, or the device reports nothing to enumerate.
    Unavailable,
    /// The top-level listing call itself failed.
    Transport { source: TransportError },
}

impl std::fmt::Display for EnumerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "Storage listing unavailable"),
            Self::Transport { source } => write!(f, "Storage listing failed: {source}"),
        }
    }
}

impl std::error::Error for EnumerationError {}

impl From<TransportError> for EnumerationError {
    fn from(source: TransportError) -> Self {
        Self::Transport { source }
    }
}

/// Errors returned to callers of session and controller operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No camera is started.
    NoActiveCamera,
    /// The caller invoked an operation the active camera doesn't offer.
    /// Callers must check `CameraHandle::supports` first, so this is a bug in the caller.
    MissingCapability { capability: Capability },
    Transport { source: TransportError },
    Enumeration { source: EnumerationError },
    /// A blocking worker panicked or was cancelled.
    WorkerFailed { message: String },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoActiveCamera => write!(f, "No camera is started"),
            Self::MissingCapability { capability } => {
                write!(f, "Camera doesn't support {capability:?}")
            }
            Self::Transport { source } => write!(f, "{source}"),
            Self::Enumeration { source } => write!(f, "{source}"),
            Self::WorkerFailed { message } => write!(f, "Worker failed: {message}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoActiveCamera => "No camera is connected.".to_string(),
            Self::MissingCapability { capability } => format!("This camera doesn't support {:?}.", capability),
            Self::Transport { source } | Self::Enumeration {
                source: EnumerationError::Transport { source },
            } => source.user_message(),
            Self::Enumeration {
                source: EnumerationError::Unavailable,
            } => "The camera has no storage to browse.".to_string(),
            Self::WorkerFailed { .. } => "Something went wrong talking to the camera. Reload to try again.".to_string(),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(source: TransportError) -> Self {
        Self::Transport { source }
    }
}

impl From<EnumerationError> for SessionError {
    fn from(source: EnumerationError) -> Self {
        Self::Enumeration { source }
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::WorkerFailed {
            message: err.to_string(),
        }
    }
}
