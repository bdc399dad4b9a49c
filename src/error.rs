use std::time::Duration;

/// Failure reported by a [`StagePort`](crate::port::StagePort) call,
/// carrying the underlying transport/protocol error text.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceError {
    pub message: String,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device error: {}", self.message)
    }
}

impl std::error::Error for DeviceError {}

#[derive(Debug)]
pub enum StageError {
    /// Port open or first readback failed; fatal to `connect`.
    Connection(String),
    /// A port call failed after connect; propagated to the caller of the
    /// operation that issued it.
    Device(DeviceError),
    /// A bounded wait expired.
    Timeout(Duration),
    /// A periodic-motion run is already in flight.
    GeneratorBusy,
    NotConnected,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageError::Connection(msg) => write!(f, "connection failed: {}", msg),
            StageError::Device(err) => write!(f, "{}", err),
            StageError::Timeout(waited) => write!(f, "timed out after {:.1}s", waited.as_secs_f64()),
            StageError::GeneratorBusy => write!(f, "waveform generator already running"),
            StageError::NotConnected => write!(f, "stage not connected"),
        }
    }
}

impl std::error::Error for StageError {}

impl From<DeviceError> for StageError {
    fn from(err: DeviceError) -> Self {
        StageError::Device(err)
    }
}
