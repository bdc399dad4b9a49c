pub mod mock;

use crate::axis::MotionLimits;
use crate::error::DeviceError;
use crate::waveform::Waveform;

/// Datum used to establish absolute position calibration after connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceMode {
    /// Trust the current position, skip the reference move.
    None,
    NegativeLimit,
    PositiveLimit,
    /// Center reference switch.
    Center,
}

/// Synchronous interface to one physical motion axis: connection,
/// telemetry readback, moves, and the waveform generator.
///
/// A port is NOT safe for unsynchronized concurrent use. The controller
/// serializes every call through a single mutex; implementations may
/// assume calls never overlap.
#[async_trait::async_trait]
pub trait StagePort: Send + Sync {
    /// Device/stage identification string (e.g. the product name
    /// reported by the controller).
    fn name(&self) -> &str;

    async fn connect(&mut self, id: &str) -> Result<(), DeviceError>;
    async fn disconnect(&mut self) -> Result<(), DeviceError>;

    async fn read_position(&self, axis: &str) -> Result<f64, DeviceError>;
    async fn read_on_target(&self, axis: &str) -> Result<bool, DeviceError>;
    async fn read_velocity(&self, axis: &str) -> Result<f64, DeviceError>;
    async fn read_servo(&self, axis: &str) -> Result<bool, DeviceError>;
    async fn query_limits(&self, axis: &str) -> Result<MotionLimits, DeviceError>;

    async fn move_absolute(&mut self, axis: &str, position: f64) -> Result<(), DeviceError>;
    async fn move_relative(&mut self, axis: &str, delta: f64) -> Result<(), DeviceError>;
    async fn set_servo(&mut self, axis: &str, enabled: bool) -> Result<(), DeviceError>;
    async fn set_velocity(&mut self, axis: &str, velocity: f64) -> Result<(), DeviceError>;
    async fn stop_axis(&mut self, axis: &str) -> Result<(), DeviceError>;
    async fn reference(&mut self, axis: &str, mode: ReferenceMode) -> Result<(), DeviceError>;

    async fn define_waveform_table(
        &mut self,
        table: u8,
        waveform: &Waveform,
    ) -> Result<(), DeviceError>;
    async fn link_generator_to_table(&mut self, generator: u8, table: u8)
        -> Result<(), DeviceError>;
    async fn set_generator_cycles(&mut self, generator: u8, cycles: u32)
        -> Result<(), DeviceError>;
    async fn set_table_rate(&mut self, generator: u8, rate: u32) -> Result<(), DeviceError>;
    async fn start_generator(&mut self, generator: u8) -> Result<(), DeviceError>;
    async fn stop_generator(&mut self, generator: u8) -> Result<(), DeviceError>;
    async fn is_generator_running(&self, generator: u8) -> Result<bool, DeviceError>;
}
