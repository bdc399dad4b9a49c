pub mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::axis::{AxisState, Direction, MotionLimits};
use crate::error::{DeviceError, StageError};
use crate::port::{ReferenceMode, StagePort};
use crate::waveform::run::{self, RunContext, WAVE_GENERATOR, WAVE_TABLE};
use crate::waveform::{GeneratorRun, RunHandle, ScanSettings, Waveform, WaveformTiming};

pub use config::{StageConfig, StageModel};

/// Ceiling on the reference move performed during connect.
const REFERENCE_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Cadence for bounded on-target waits.
const ON_TARGET_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// A single telemetry refresh may not take longer than this.
const TELEMETRY_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// How long disconnect waits for the poll loop to stop.
const POLL_JOIN_GRACE: Duration = Duration::from_secs(1);
/// How long disconnect waits for a cancelled run to wind down.
const RUN_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// What a move operation actually sent to the port. `out_of_range` is
/// the soft range-violation flag: the request was clamped (absolute) or
/// zeroed (relative) and warned about, never rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveReport {
    pub commanded: f64,
    pub out_of_range: bool,
}

/// Snapshot served to protocol/GUI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: String,
    /// Home-relative position in mm.
    pub position: f64,
    pub raw_position: f64,
    pub on_target: bool,
    pub servo_enabled: bool,
    pub velocity: f64,
    pub home: f64,
    pub run_id: Option<Uuid>,
    pub run_phase: Option<String>,
}

struct PollTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: StageConfig,
    port: Arc<Mutex<Box<dyn StagePort>>>,
    state: Arc<RwLock<AxisState>>,
    limits: RwLock<Option<MotionLimits>>,
    timing: RwLock<WaveformTiming>,
    connected: AtomicBool,
    poll: Mutex<Option<PollTask>>,
    run: Mutex<Option<RunHandle>>,
}

/// Mediates all interaction with one stage axis: range-checked moves
/// with backlash correction, homing, periodic motion, and a background
/// poll loop keeping cached telemetry fresh.
///
/// All port calls serialize through one mutex; the poll loop, the
/// waveform worker and caller commands never overlap on the wire.
#[derive(Clone)]
pub struct StageController {
    inner: Arc<Inner>,
}

impl StageController {
    pub fn new(config: StageConfig, port: Box<dyn StagePort>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                port: Arc::new(Mutex::new(port)),
                state: Arc::new(RwLock::new(AxisState::default())),
                limits: RwLock::new(None),
                timing: RwLock::new(WaveformTiming::default()),
                connected: AtomicBool::new(false),
                poll: Mutex::new(None),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Open the port, enable the servo, run the configured reference
    /// move, fetch the travel limits, seed the telemetry cache and
    /// start the poll loop.
    pub async fn connect(&self) -> Result<(), StageError> {
        if self.is_connected() {
            warn!(stage = %self.inner.config.model.name, "connect called while already connected");
            return Ok(());
        }
        let config = &self.inner.config;
        {
            let mut port = self.inner.port.lock().await;
            port.connect(&config.port_identifier)
                .await
                .map_err(|err| StageError::Connection(err.message))?;

            match initialize(port.as_mut(), config).await {
                Ok((limits, state)) => {
                    info!(
                        stage = %config.model.name,
                        port = port.name(),
                        min = limits.min,
                        max = limits.max,
                        "stage connected"
                    );
                    *self.inner.limits.write().await = Some(limits);
                    *self.inner.state.write().await = state;
                }
                Err(err) => {
                    let _ = port.disconnect().await;
                    return Err(StageError::Connection(err.message));
                }
            }
        }
        self.inner.connected.store(true, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            self.inner.port.clone(),
            self.inner.state.clone(),
            config.axis_id.clone(),
            config.poll_interval,
            stop_rx,
        ));
        *self.inner.poll.lock().await = Some(PollTask { stop: stop_tx, task });
        Ok(())
    }

    /// Cancel any in-flight run, stop the poll loop, disable the servo
    /// and close the port. Calling while not connected is a no-op.
    pub async fn disconnect(&self) -> Result<(), StageError> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.inner.run.lock().await.take() {
            if !handle.is_finished() {
                handle.cancel();
                let mut handle = handle;
                if timeout(RUN_CANCEL_GRACE, handle.wait()).await.is_err() {
                    warn!("periodic-motion worker did not stop within grace period");
                }
            }
        }
        if let Some(poll) = self.inner.poll.lock().await.take() {
            let _ = poll.stop.send(true);
            if timeout(POLL_JOIN_GRACE, poll.task).await.is_err() {
                warn!("poll loop did not stop within {:?}", POLL_JOIN_GRACE);
            }
        }
        let mut port = self.inner.port.lock().await;
        if let Err(err) = port.set_servo(&self.inner.config.axis_id, false).await {
            warn!(error = %err, "servo disable during disconnect failed");
        }
        port.disconnect().await?;
        info!(stage = %self.inner.config.model.name, "stage disconnected");
        Ok(())
    }

    /// Move to a home-relative target. Out-of-range targets are clamped
    /// to the nearest bound and warned about. Non-blocking: returns as
    /// soon as the command is issued.
    pub async fn move_absolute(
        &self,
        target: f64,
        correct_backlash: bool,
    ) -> Result<MoveReport, StageError> {
        self.ensure_connected()?;
        let limits = self.limits().await.ok_or(StageError::NotConnected)?;
        let (home, previous_direction) = {
            let state = self.inner.state.read().await;
            (state.home, state.direction)
        };
        let raw_target = home + target;
        let commanded = limits.clamp(raw_target);
        let out_of_range = raw_target != commanded;
        if raw_target < limits.min {
            warn!(target = raw_target, min = limits.min, "target below range, clamping");
        } else if raw_target > limits.max {
            warn!(target = raw_target, max = limits.max, "target above range, clamping");
        }

        let axis = &self.inner.config.axis_id;
        let mut port = self.inner.port.lock().await;
        let current = port.read_position(axis).await?;
        let direction = Direction::from_displacement(raw_target - current);
        if correct_backlash && direction.reverses(previous_direction) {
            let delta = self.inner.config.backlash_delta * direction.sign();
            port.move_relative(axis, delta).await?;
            port.move_relative(axis, -delta).await?;
        }
        port.move_absolute(axis, commanded).await?;
        drop(port);

        self.inner.state.write().await.direction = direction;
        Ok(MoveReport {
            commanded,
            out_of_range,
        })
    }

    /// Move by a delta. If the projected position would leave the
    /// range, the displacement is zeroed (and still issued) rather than
    /// clamped; the asymmetry with `move_absolute` is deliberate.
    pub async fn move_relative(
        &self,
        delta: f64,
        correct_backlash: bool,
    ) -> Result<MoveReport, StageError> {
        self.ensure_connected()?;
        let limits = self.limits().await.ok_or(StageError::NotConnected)?;
        let previous_direction = self.inner.state.read().await.direction;

        let axis = &self.inner.config.axis_id;
        let mut port = self.inner.port.lock().await;
        let current = port.read_position(axis).await?;
        let projected = current + delta;
        let out_of_range = !limits.contains(projected);
        let commanded = if out_of_range {
            warn!(
                projected,
                min = limits.min,
                max = limits.max,
                "projected position outside range, zeroing displacement"
            );
            0.0
        } else {
            delta
        };
        let direction = Direction::from_displacement(commanded);
        if correct_backlash && direction.reverses(previous_direction) {
            let dither = self.inner.config.backlash_delta * direction.sign();
            port.move_relative(axis, dither).await?;
            port.move_relative(axis, -dither).await?;
        }
        port.move_relative(axis, commanded).await?;
        drop(port);

        self.inner.state.write().await.direction = direction;
        Ok(MoveReport {
            commanded,
            out_of_range,
        })
    }

    /// Record the current measured position as the logical zero.
    pub async fn set_home(&self) -> Result<(), StageError> {
        self.ensure_connected()?;
        let position = {
            let port = self.inner.port.lock().await;
            port.read_position(&self.inner.config.axis_id).await?
        };
        let mut state = self.inner.state.write().await;
        state.position = position;
        state.home = position;
        info!(home = position, "home offset recorded");
        Ok(())
    }

    /// Command a move back to the home offset; fire-and-forget. Callers
    /// needing completion poll `on_target`.
    pub async fn go_home(&self) -> Result<(), StageError> {
        self.move_absolute(0.0, false).await.map(|_| ())
    }

    /// Best-effort halt. Signals an active periodic-motion run to wind
    /// down and stops the axis; port errors are deliberately swallowed
    /// here, unlike everywhere else.
    pub async fn stop(&self) {
        if !self.is_connected() {
            return;
        }
        if let Some(handle) = self.inner.run.lock().await.as_ref() {
            handle.cancel();
        }
        let mut port = self.inner.port.lock().await;
        if let Err(err) = port.stop_axis(&self.inner.config.axis_id).await {
            debug!(error = %err, "halt error suppressed");
        }
    }

    /// Block until the axis settles or the deadline passes.
    pub async fn wait_on_target(&self, wait: Duration) -> Result<(), StageError> {
        self.ensure_connected()?;
        let deadline = Instant::now() + wait;
        loop {
            let on_target = {
                let port = self.inner.port.lock().await;
                port.read_on_target(&self.inner.config.axis_id).await?
            };
            if on_target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StageError::Timeout(wait));
            }
            sleep(ON_TARGET_POLL_INTERVAL).await;
        }
    }

    pub async fn set_velocity(&self, requested: f64) -> Result<f64, StageError> {
        self.ensure_connected()?;
        let (min, max) = self.inner.config.velocity_range;
        let velocity = requested.min(max).max(min);
        if velocity != requested {
            debug!(requested, applied = velocity, "velocity clamped to stage range");
        }
        {
            let mut port = self.inner.port.lock().await;
            port.set_velocity(&self.inner.config.axis_id, velocity).await?;
        }
        self.inner.state.write().await.velocity = velocity;
        Ok(velocity)
    }

    pub async fn set_servo(&self, enabled: bool) -> Result<(), StageError> {
        self.ensure_connected()?;
        {
            let mut port = self.inner.port.lock().await;
            port.set_servo(&self.inner.config.axis_id, enabled).await?;
        }
        self.inner.state.write().await.servo_enabled = enabled;
        Ok(())
    }

    /// Recompute the cached table-point count for a new scan frequency.
    pub async fn set_scan_frequency(&self, frequency_hz: f64) {
        self.inner.timing.write().await.set_frequency(frequency_hz);
    }

    pub async fn timing(&self) -> WaveformTiming {
        *self.inner.timing.read().await
    }

    /// Spawn a periodic-motion run for an already-built waveform.
    /// Refuses while another run is in flight.
    pub async fn start_periodic_motion(
        &self,
        waveform: Waveform,
        cycles: u32,
        table_rate: u32,
    ) -> Result<RunHandle, StageError> {
        self.ensure_connected()?;
        let mut slot = self.inner.run.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.is_finished() {
                return Err(StageError::GeneratorBusy);
            }
        }
        let ctx = RunContext {
            port: self.inner.port.clone(),
            state: self.inner.state.clone(),
            axis: self.inner.config.axis_id.clone(),
            generator: WAVE_GENERATOR,
            table: WAVE_TABLE,
            sample_interval: self.inner.config.poll_interval,
        };
        let generator_run = GeneratorRun::new(
            cycles,
            table_rate,
            self.inner.config.waveform_safety_timeout,
        );
        let handle = run::spawn(ctx, waveform, generator_run);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Build the waveform for the given scan settings (anchored to the
    /// current home and limits) and start it.
    pub async fn start_scan(&self, settings: &ScanSettings) -> Result<RunHandle, StageError> {
        self.ensure_connected()?;
        let limits = self.limits().await.ok_or(StageError::NotConnected)?;
        let home = self.inner.state.read().await.home;
        {
            let mut timing = self.inner.timing.write().await;
            timing.set_table_rate(settings.table_rate);
            timing.set_frequency(settings.frequency_hz);
        }
        let timing = self.timing().await;
        let waveform = settings.build(&timing, home, limits);
        self.start_periodic_motion(waveform, settings.cycles, settings.table_rate)
            .await
    }

    pub async fn active_run(&self) -> Option<RunHandle> {
        self.inner.run.lock().await.clone()
    }

    pub async fn axis_state(&self) -> AxisState {
        self.inner.state.read().await.clone()
    }

    /// Home-relative cached position.
    pub async fn position(&self) -> f64 {
        self.inner.state.read().await.relative_position()
    }

    pub async fn on_target(&self) -> bool {
        self.inner.state.read().await.on_target
    }

    pub async fn limits(&self) -> Option<MotionLimits> {
        *self.inner.limits.read().await
    }

    pub async fn status(&self) -> StageStatus {
        let state = self.axis_state().await;
        let (run_id, run_phase) = match self.inner.run.lock().await.as_ref() {
            Some(handle) => (Some(handle.id), Some(handle.phase().label().to_string())),
            None => (None, None),
        };
        StageStatus {
            stage: self.inner.config.model.name.clone(),
            position: state.relative_position(),
            raw_position: state.position,
            on_target: state.on_target,
            servo_enabled: state.servo_enabled,
            velocity: state.velocity,
            home: state.home,
            run_id,
            run_phase,
        }
    }

    fn ensure_connected(&self) -> Result<(), StageError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StageError::NotConnected)
        }
    }
}

/// Servo on, reference move with a bounded settle wait, then the first
/// synchronous readback seeding limits and telemetry. Limits are
/// queried once, after referencing, and never refetched.
async fn initialize(
    port: &mut dyn StagePort,
    config: &StageConfig,
) -> Result<(MotionLimits, AxisState), DeviceError> {
    port.set_servo(&config.axis_id, true).await?;
    if config.reference_mode != ReferenceMode::None {
        port.reference(&config.axis_id, config.reference_mode).await?;
        let deadline = Instant::now() + REFERENCE_SETTLE_TIMEOUT;
        loop {
            if port.read_on_target(&config.axis_id).await? {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::new("reference move did not settle"));
            }
            sleep(ON_TARGET_POLL_INTERVAL).await;
        }
    }
    let limits = port.query_limits(&config.axis_id).await?;
    let position = port.read_position(&config.axis_id).await?;
    let state = AxisState {
        position,
        on_target: port.read_on_target(&config.axis_id).await?,
        servo_enabled: port.read_servo(&config.axis_id).await?,
        velocity: port.read_velocity(&config.axis_id).await?,
        home: position,
        direction: Direction::Positive,
    };
    Ok((limits, state))
}

/// Read-only refresh of position and on-target at a fixed cadence. One
/// bad read is logged and skipped; each refresh is bounded so a wedged
/// port cannot starve shutdown.
async fn poll_loop(
    port: Arc<Mutex<Box<dyn StagePort>>>,
    state: Arc<RwLock<AxisState>>,
    axis: String,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        match timeout(TELEMETRY_READ_TIMEOUT, refresh(&port, &state, &axis)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "telemetry refresh failed"),
            Err(_) => warn!("telemetry refresh timed out"),
        }
    }
    debug!("poll loop stopped");
}

async fn refresh(
    port: &Mutex<Box<dyn StagePort>>,
    state: &RwLock<AxisState>,
    axis: &str,
) -> Result<(), DeviceError> {
    let (position, on_target) = {
        let port = port.lock().await;
        (
            port.read_position(axis).await?,
            port.read_on_target(axis).await?,
        )
    };
    let mut state = state.write().await;
    state.position = position;
    state.on_target = on_target;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockStagePort, PortCall};
    use crate::waveform::{RunOutcome, ScanMode, StartPoint};

    fn test_config() -> StageConfig {
        StageConfig::new("SIM0001", StageModel::generic("SIM-STAGE.01", 10.0))
    }

    async fn connected(mock: MockStagePort) -> StageController {
        let controller = StageController::new(test_config(), Box::new(mock));
        controller.connect().await.unwrap();
        controller
    }

    fn dithers(calls: &[PortCall]) -> Vec<f64> {
        calls
            .iter()
            .filter_map(|c| match c {
                PortCall::MoveRelative(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_seeds_cache_and_limits() {
        let mock = MockStagePort::new().with_position(1.0);
        let controller = connected(mock.clone()).await;

        let state = controller.axis_state().await;
        assert_eq!(state.position, 1.0);
        assert_eq!(state.home, 1.0);
        assert_eq!(controller.limits().await, Some(MotionLimits::new(-5.0, 5.0)));
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::SetServo(true))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_references_known_models() {
        let mock = MockStagePort::new().with_position(4.0);
        let config = StageConfig::new("0185500006", StageModel::known("V-524.1AA").unwrap());
        let controller = StageController::new(config, Box::new(mock.clone()));
        controller.connect().await.unwrap();

        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::Reference(ReferenceMode::Center))),
            1
        );
        // home is recorded after the reference move, at the center
        assert_eq!(controller.axis_state().await.home, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_is_a_connection_error() {
        let mock = MockStagePort::new();
        mock.fail_on("connect");
        let controller = StageController::new(test_config(), Box::new(mock));
        match controller.connect().await {
            Err(StageError::Connection(_)) => {}
            other => panic!("expected connection error, got {:?}", other.err()),
        }
        assert!(!controller.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn absolute_move_clamps_and_warns() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        let report = controller.move_absolute(7.0, false).await.unwrap();
        assert!(report.out_of_range);
        assert_eq!(report.commanded, 5.0);
        // the port sees the clamped value, never the raw target
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::MoveAbsolute(p) if *p == 5.0)),
            1
        );
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::MoveAbsolute(p) if *p == 7.0)),
            0
        );

        let report = controller.move_absolute(-1.5, false).await.unwrap();
        assert!(!report.out_of_range);
        assert_eq!(report.commanded, -1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn relative_move_zeroes_instead_of_clamping() {
        let mock = MockStagePort::new().with_position(5.0);
        let controller = connected(mock.clone()).await;

        let report = controller.move_relative(-20.0, false).await.unwrap();
        assert!(report.out_of_range);
        assert_eq!(report.commanded, 0.0);
        // the zeroed displacement is still issued; no nonzero move goes out
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::MoveRelative(d) if *d == 0.0)),
            1
        );
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::MoveRelative(d) if *d != 0.0)),
            0
        );
        assert_eq!(mock.raw_position(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn backlash_dithers_exactly_twice_on_reversal() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        // recorded direction starts positive; a negative move reverses it
        controller.move_absolute(-2.0, true).await.unwrap();
        assert_eq!(dithers(&mock.calls()), vec![-0.05, 0.05]);
        // the dithers precede the real move
        let calls = mock.calls();
        let move_index = calls
            .iter()
            .position(|c| matches!(c, PortCall::MoveAbsolute(_)))
            .unwrap();
        assert!(calls[..move_index]
            .iter()
            .filter(|c| matches!(c, PortCall::MoveRelative(_)))
            .count()
            == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backlash_skipped_when_direction_holds() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        controller.move_absolute(2.0, true).await.unwrap();
        assert!(dithers(&mock.calls()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        controller.disconnect().await.unwrap();
        controller.disconnect().await.unwrap();

        assert_eq!(mock.count_calls(|c| matches!(c, PortCall::Disconnect)), 1);
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::SetServo(false))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_home_zeroes_relative_position() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        controller.move_absolute(2.0, false).await.unwrap();
        controller.set_home().await.unwrap();

        assert_eq!(controller.position().await, 0.0);
        // the raw device position is untouched
        assert_eq!(mock.raw_position(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_on_target_resolves_and_times_out() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        mock.script_on_target_reads(3);
        controller
            .wait_on_target(Duration::from_secs(5))
            .await
            .unwrap();

        mock.script_on_target_reads(u32::MAX);
        match controller.wait_on_target(Duration::from_millis(200)).await {
            Err(StageError::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn velocity_clamps_into_model_range() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        assert_eq!(controller.set_velocity(99.0).await.unwrap(), 10.0);
        assert_eq!(controller.set_velocity(0.0).await.unwrap(), 0.01);
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::SetVelocity(v) if *v == 10.0)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_completes_when_generator_stops() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;
        mock.script_generator_polls(Some(3));

        let waveform = Waveform::sinusoidal(500, 3.0, -1.5);
        let mut handle = controller
            .start_periodic_motion(waveform.clone(), 2, 2)
            .await
            .unwrap();

        match handle.wait().await {
            RunOutcome::Completed(stats) => assert!(stats.elapsed >= Duration::from_secs(3)),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::StopGenerator(_))),
            1
        );
        assert_eq!(
            mock.count_calls(
                |c| matches!(c, PortCall::DefineWaveformTable(t, w) if *t == 2 && *w == waveform)
            ),
            1
        );
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::SetGeneratorCycles(_, n) if *n == 2)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_is_force_stopped_at_safety_timeout() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;
        mock.script_generator_polls(None);

        let mut handle = controller
            .start_periodic_motion(Waveform::ramp(500, 2.0, 0.0), 1, 2)
            .await
            .unwrap();

        match handle.wait().await {
            RunOutcome::TimedOut(stats) => {
                assert!(stats.elapsed >= Duration::from_secs(60));
                assert!(stats.elapsed < Duration::from_secs(62));
            }
            other => panic!("expected safety cutoff, got {:?}", other),
        }
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::StopGenerator(_))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn programming_failure_never_starts_the_generator() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;
        mock.fail_on("define_waveform_table");

        let mut handle = controller
            .start_periodic_motion(Waveform::ramp(500, 2.0, 0.0), 1, 2)
            .await
            .unwrap();

        match handle.wait().await {
            RunOutcome::Failed(reason) => assert!(reason.contains("programming")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::StartGenerator(_))),
            0
        );
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::StopGenerator(_))),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_run_and_swallows_halt_errors() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;
        mock.script_generator_polls(None);

        let mut handle = controller
            .start_periodic_motion(Waveform::ramp(500, 2.0, 0.0), 1, 2)
            .await
            .unwrap();
        // let the worker reach Running
        sleep(Duration::from_millis(500)).await;

        mock.fail_on("stop_axis");
        controller.stop().await;

        assert_eq!(handle.wait().await, RunOutcome::Cancelled);
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::StopGenerator(_))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_refused_while_one_is_active() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;
        mock.script_generator_polls(None);

        let mut first = controller
            .start_periodic_motion(Waveform::ramp(500, 2.0, 0.0), 1, 2)
            .await
            .unwrap();
        match controller
            .start_periodic_motion(Waveform::ramp(500, 2.0, 0.0), 1, 2)
            .await
        {
            Err(StageError::GeneratorBusy) => {}
            other => panic!("expected busy, got {:?}", other.err()),
        }
        first.cancel();
        first.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_refreshes_cached_telemetry() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        mock.set_raw_position(3.3);
        sleep(Duration::from_millis(200)).await;

        assert_eq!(controller.axis_state().await.position, 3.3);
        controller.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_against_the_mock_port() {
        let mock = MockStagePort::new();
        let controller = connected(mock.clone()).await;

        let report = controller.move_absolute(7.0, false).await.unwrap();
        assert_eq!((report.commanded, report.out_of_range), (5.0, true));

        let report = controller.move_relative(-20.0, false).await.unwrap();
        assert_eq!((report.commanded, report.out_of_range), (0.0, true));

        mock.script_generator_polls(Some(3));
        let settings = ScanSettings {
            mode: ScanMode::Sinusoidal,
            amplitude: 3.0,
            cycles: 2,
            table_rate: 2,
            frequency_hz: 5.0,
            start: StartPoint::Home,
            center_point: None,
            speed_up_down: None,
        };
        let mut handle = controller.start_scan(&settings).await.unwrap();
        assert!(matches!(handle.wait().await, RunOutcome::Completed(_)));
        assert_eq!(
            mock.count_calls(|c| matches!(c, PortCall::StopGenerator(_))),
            1
        );

        controller.disconnect().await.unwrap();
    }
}
