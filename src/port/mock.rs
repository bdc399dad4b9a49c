//! In-memory stage port with scripted behavior, used by the test suite
//! and the `mock_stage` demo. Commands are recorded so callers can
//! assert on exactly what reached the hardware.

use std::sync::{Arc, Mutex};

use super::{ReferenceMode, StagePort};
use crate::axis::MotionLimits;
use crate::error::DeviceError;
use crate::waveform::Waveform;

/// One command issued to the port. Readbacks are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum PortCall {
    Connect(String),
    Disconnect,
    MoveAbsolute(f64),
    MoveRelative(f64),
    SetServo(bool),
    SetVelocity(f64),
    StopAxis,
    Reference(ReferenceMode),
    DefineWaveformTable(u8, Waveform),
    LinkGeneratorToTable(u8, u8),
    SetGeneratorCycles(u8, u32),
    SetTableRate(u8, u32),
    StartGenerator(u8),
    StopGenerator(u8),
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    position: f64,
    velocity: f64,
    servo: bool,
    limits: MotionLimits,
    /// Reads of the on-target flag that report false before it flips.
    on_target_false_reads: u32,
    generator_started: bool,
    /// `Some(n)`: the running flag reads true n times after start, then
    /// false. `None`: runs until force-stopped.
    generator_true_polls: Option<u32>,
    fail_on: Option<String>,
    calls: Vec<PortCall>,
}

/// Cloning shares the underlying state, so a test can keep a handle
/// while the controller owns the boxed port.
#[derive(Debug, Clone)]
pub struct MockStagePort {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockStagePort {
    pub fn new() -> Self {
        Self {
            name: "SIM-STAGE.01".to_string(),
            state: Arc::new(Mutex::new(MockState {
                connected: false,
                position: 0.0,
                velocity: 1.0,
                servo: false,
                limits: MotionLimits::new(-5.0, 5.0),
                on_target_false_reads: 0,
                generator_started: false,
                generator_true_polls: Some(0),
                fail_on: None,
                calls: Vec::new(),
            })),
        }
    }

    pub fn with_limits(self, min: f64, max: f64) -> Self {
        self.state.lock().unwrap().limits = MotionLimits::new(min, max);
        self
    }

    pub fn with_position(self, position: f64) -> Self {
        self.state.lock().unwrap().position = position;
        self
    }

    pub fn raw_position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    pub fn set_raw_position(&self, position: f64) {
        self.state.lock().unwrap().position = position;
    }

    /// Script the on-target flag to read false this many times.
    pub fn script_on_target_reads(&self, false_reads: u32) {
        self.state.lock().unwrap().on_target_false_reads = false_reads;
    }

    /// Script how many polls the generator reports running for after a
    /// start; `None` keeps it running until force-stopped.
    pub fn script_generator_polls(&self, true_polls: Option<u32>) {
        self.state.lock().unwrap().generator_true_polls = true_polls;
    }

    /// Make the named operation fail with a device error.
    pub fn fail_on(&self, operation: &str) {
        self.state.lock().unwrap().fail_on = Some(operation.to_string());
    }

    pub fn calls(&self) -> Vec<PortCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&PortCall) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|&c| matches(c)).count()
    }
}

impl Default for MockStagePort {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn check(&mut self, operation: &str) -> Result<(), DeviceError> {
        if !self.connected && operation != "connect" {
            return Err(DeviceError::new("port not open"));
        }
        if self.fail_on.as_deref() == Some(operation) {
            return Err(DeviceError::new(format!("{} rejected", operation)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StagePort for MockStagePort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, id: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("connect")?;
        state.connected = true;
        state.calls.push(PortCall::Connect(id.to_string()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("disconnect")?;
        state.connected = false;
        state.calls.push(PortCall::Disconnect);
        Ok(())
    }

    async fn read_position(&self, _axis: &str) -> Result<f64, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("read_position")?;
        Ok(state.position)
    }

    async fn read_on_target(&self, _axis: &str) -> Result<bool, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("read_on_target")?;
        if state.on_target_false_reads > 0 {
            state.on_target_false_reads -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    async fn read_velocity(&self, _axis: &str) -> Result<f64, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("read_velocity")?;
        Ok(state.velocity)
    }

    async fn read_servo(&self, _axis: &str) -> Result<bool, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("read_servo")?;
        Ok(state.servo)
    }

    async fn query_limits(&self, _axis: &str) -> Result<MotionLimits, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("query_limits")?;
        Ok(state.limits)
    }

    async fn move_absolute(&mut self, _axis: &str, position: f64) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("move_absolute")?;
        state.position = position;
        state.calls.push(PortCall::MoveAbsolute(position));
        Ok(())
    }

    async fn move_relative(&mut self, _axis: &str, delta: f64) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("move_relative")?;
        state.position += delta;
        state.calls.push(PortCall::MoveRelative(delta));
        Ok(())
    }

    async fn set_servo(&mut self, _axis: &str, enabled: bool) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("set_servo")?;
        state.servo = enabled;
        state.calls.push(PortCall::SetServo(enabled));
        Ok(())
    }

    async fn set_velocity(&mut self, _axis: &str, velocity: f64) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("set_velocity")?;
        state.velocity = velocity;
        state.calls.push(PortCall::SetVelocity(velocity));
        Ok(())
    }

    async fn stop_axis(&mut self, _axis: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("stop_axis")?;
        state.calls.push(PortCall::StopAxis);
        Ok(())
    }

    async fn reference(&mut self, _axis: &str, mode: ReferenceMode) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("reference")?;
        state.position = match mode {
            ReferenceMode::None => state.position,
            ReferenceMode::NegativeLimit => state.limits.min,
            ReferenceMode::PositiveLimit => state.limits.max,
            ReferenceMode::Center => state.limits.midpoint(),
        };
        state.calls.push(PortCall::Reference(mode));
        Ok(())
    }

    async fn define_waveform_table(
        &mut self,
        table: u8,
        waveform: &Waveform,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("define_waveform_table")?;
        state
            .calls
            .push(PortCall::DefineWaveformTable(table, waveform.clone()));
        Ok(())
    }

    async fn link_generator_to_table(
        &mut self,
        generator: u8,
        table: u8,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("link_generator_to_table")?;
        state.calls.push(PortCall::LinkGeneratorToTable(generator, table));
        Ok(())
    }

    async fn set_generator_cycles(
        &mut self,
        generator: u8,
        cycles: u32,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("set_generator_cycles")?;
        state.calls.push(PortCall::SetGeneratorCycles(generator, cycles));
        Ok(())
    }

    async fn set_table_rate(&mut self, generator: u8, rate: u32) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("set_table_rate")?;
        state.calls.push(PortCall::SetTableRate(generator, rate));
        Ok(())
    }

    async fn start_generator(&mut self, generator: u8) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("start_generator")?;
        state.generator_started = true;
        state.calls.push(PortCall::StartGenerator(generator));
        Ok(())
    }

    async fn stop_generator(&mut self, generator: u8) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("stop_generator")?;
        state.generator_started = false;
        state.calls.push(PortCall::StopGenerator(generator));
        Ok(())
    }

    async fn is_generator_running(&self, _generator: u8) -> Result<bool, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.check("is_generator_running")?;
        if !state.generator_started {
            return Ok(false);
        }
        match &mut state.generator_true_polls {
            None => Ok(true),
            Some(0) => Ok(false),
            Some(n) => {
                *n -= 1;
                Ok(true)
            }
        }
    }
}
