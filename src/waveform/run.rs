use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::table::Waveform;
use crate::axis::AxisState;
use crate::error::DeviceError;
use crate::port::StagePort;

/// Wave generator unit driving the axis.
pub const WAVE_GENERATOR: u8 = 1;
/// Wave table the profile is uploaded to.
pub const WAVE_TABLE: u8 = 2;

/// Cadence at which the worker polls the generator-running flag.
pub const GENERATOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parameters of one in-flight waveform execution. Owned by the worker;
/// start times are stamped when the generator actually starts.
#[derive(Debug, Clone)]
pub struct GeneratorRun {
    pub cycles: u32,
    pub table_rate: u32,
    /// Hard safety bound on the Running state, distinct from normal
    /// completion.
    pub timeout: Duration,
    pub started_at: Option<DateTime<Utc>>,
}

impl GeneratorRun {
    pub fn new(cycles: u32, table_rate: u32, timeout: Duration) -> Self {
        Self {
            cycles,
            table_rate,
            timeout,
            started_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunPhase {
    Idle,
    /// Uploading the wave table and generator configuration.
    Programming,
    /// Waiting for the axis to settle before the generator starts.
    WaitingStart,
    Running,
    /// Generator stop issued unconditionally on every exit from Running.
    Stopping,
    Finished(RunOutcome),
}

impl RunPhase {
    pub fn label(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Programming => "programming",
            RunPhase::WaitingStart => "waiting-start",
            RunPhase::Running => "running",
            RunPhase::Stopping => "stopping",
            RunPhase::Finished(RunOutcome::Completed(_)) => "completed",
            RunPhase::Finished(RunOutcome::TimedOut(_)) => "timed-out",
            RunPhase::Finished(RunOutcome::Cancelled) => "cancelled",
            RunPhase::Finished(RunOutcome::Failed(_)) => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RunPhase::Finished(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The generator reported not-running before the safety timeout.
    Completed(RunStats),
    /// The safety cutoff fired; the generator was force-stopped.
    TimedOut(RunStats),
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub elapsed: Duration,
    /// Min/max position observed by the sampling sub-task, if any
    /// samples were taken.
    pub observed_span: Option<(f64, f64)>,
}

/// Caller-side view of a spawned run: poll the phase, await the
/// outcome, or cancel.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub id: Uuid,
    phase: watch::Receiver<RunPhase>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn phase(&self) -> RunPhase {
        self.phase.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.phase.borrow().is_finished()
    }

    /// Signal the worker to transition to Stopping at the next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(&mut self) -> RunOutcome {
        loop {
            if let RunPhase::Finished(outcome) = &*self.phase.borrow() {
                return outcome.clone();
            }
            if self.phase.changed().await.is_err() {
                return RunOutcome::Failed("waveform worker dropped".to_string());
            }
        }
    }
}

/// Everything the worker needs from the controller; run parameters
/// travel in values, never in shared scratch state.
pub(crate) struct RunContext {
    pub port: Arc<Mutex<Box<dyn StagePort>>>,
    pub state: Arc<RwLock<AxisState>>,
    pub axis: String,
    pub generator: u8,
    pub table: u8,
    /// Cadence of the observational position sampler.
    pub sample_interval: Duration,
}

pub(crate) fn spawn(ctx: RunContext, waveform: Waveform, run: GeneratorRun) -> RunHandle {
    let id = Uuid::new_v4();
    let (phase_tx, phase_rx) = watch::channel(RunPhase::Idle);
    let cancel = CancellationToken::new();

    let handle = RunHandle {
        id,
        phase: phase_rx,
        cancel: cancel.clone(),
    };
    tokio::spawn(execute(ctx, waveform, run, phase_tx, cancel, id));
    handle
}

async fn execute(
    ctx: RunContext,
    waveform: Waveform,
    run: GeneratorRun,
    phase: watch::Sender<RunPhase>,
    cancel: CancellationToken,
    id: Uuid,
) {
    info!(
        run = %id,
        shape = waveform.shape_name(),
        cycles = run.cycles,
        "starting periodic motion"
    );
    let outcome = drive(&ctx, &waveform, run, &phase, &cancel).await;
    match &outcome {
        RunOutcome::Completed(stats) => {
            info!(run = %id, elapsed = ?stats.elapsed, "periodic motion completed")
        }
        RunOutcome::TimedOut(stats) => {
            warn!(run = %id, elapsed = ?stats.elapsed, "periodic motion hit safety cutoff")
        }
        RunOutcome::Cancelled => info!(run = %id, "periodic motion cancelled"),
        RunOutcome::Failed(reason) => warn!(run = %id, reason = %reason, "periodic motion failed"),
    }
    let _ = phase.send(RunPhase::Finished(outcome));
}

async fn drive(
    ctx: &RunContext,
    waveform: &Waveform,
    mut run: GeneratorRun,
    phase: &watch::Sender<RunPhase>,
    cancel: &CancellationToken,
) -> RunOutcome {
    // Programming: any port failure aborts before the generator can
    // play a partial table.
    let _ = phase.send(RunPhase::Programming);
    {
        let mut port = ctx.port.lock().await;
        if let Err(err) = program(port.as_mut(), ctx, waveform, &run).await {
            return RunOutcome::Failed(format!("waveform programming failed: {}", err));
        }
    }

    // WaitingStart: the axis must have settled before the generator
    // takes over, bounded by the same safety ceiling as the run itself.
    let _ = phase.send(RunPhase::WaitingStart);
    let settle_deadline = Instant::now() + run.timeout;
    loop {
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        let on_target = {
            let port = ctx.port.lock().await;
            port.read_on_target(&ctx.axis).await
        };
        match on_target {
            Ok(true) => break,
            Ok(false) => {
                if Instant::now() >= settle_deadline {
                    return RunOutcome::Failed(
                        "axis did not settle before generator start".to_string(),
                    );
                }
            }
            Err(err) => return RunOutcome::Failed(format!("settle check failed: {}", err)),
        }
        tokio::select! {
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            _ = sleep(SETTLE_POLL_INTERVAL) => {}
        }
    }

    let _ = phase.send(RunPhase::Running);
    let started = Instant::now();
    run.started_at = Some(Utc::now());
    {
        let mut port = ctx.port.lock().await;
        if let Err(err) = port.start_generator(ctx.generator).await {
            // The generator state is unknown here; make sure it is not
            // left driving the axis.
            if let Err(stop_err) = port.stop_generator(ctx.generator).await {
                warn!(error = %stop_err, "generator stop after failed start also failed");
            }
            return RunOutcome::Failed(format!("generator start failed: {}", err));
        }
    }

    let sampler = tokio::spawn(sample_positions(
        ctx.state.clone(),
        phase.subscribe(),
        ctx.sample_interval,
    ));

    enum Exit {
        Completed,
        TimedOut,
        Cancelled,
        Failed(String),
    }

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Exit::Cancelled,
            _ = sleep(GENERATOR_POLL_INTERVAL) => {}
        }
        let running = {
            let port = ctx.port.lock().await;
            port.is_generator_running(ctx.generator).await
        };
        match running {
            Ok(false) => break Exit::Completed,
            Ok(true) => {
                if started.elapsed() >= run.timeout {
                    break Exit::TimedOut;
                }
                debug!(elapsed = ?started.elapsed(), "generator still running");
            }
            Err(err) => break Exit::Failed(format!("generator poll failed: {}", err)),
        }
    };

    let _ = phase.send(RunPhase::Stopping);
    {
        let mut port = ctx.port.lock().await;
        if let Err(err) = port.stop_generator(ctx.generator).await {
            warn!(error = %err, "generator stop failed");
        }
    }

    let observed_span = sampler.await.ok().flatten();
    let stats = RunStats {
        elapsed: started.elapsed(),
        observed_span,
    };
    match exit {
        Exit::Completed => RunOutcome::Completed(stats),
        Exit::TimedOut => RunOutcome::TimedOut(stats),
        Exit::Cancelled => RunOutcome::Cancelled,
        Exit::Failed(reason) => RunOutcome::Failed(reason),
    }
}

async fn program(
    port: &mut dyn StagePort,
    ctx: &RunContext,
    waveform: &Waveform,
    run: &GeneratorRun,
) -> Result<(), DeviceError> {
    port.define_waveform_table(ctx.table, waveform).await?;
    port.link_generator_to_table(ctx.generator, ctx.table).await?;
    port.set_generator_cycles(ctx.generator, run.cycles).await?;
    port.set_table_rate(ctx.generator, run.table_rate).await?;
    Ok(())
}

/// Observational sub-task: folds min/max over the cached position while
/// the run is in the Running state. Never touches the port and never
/// affects the state machine.
async fn sample_positions(
    state: Arc<RwLock<AxisState>>,
    mut phase: watch::Receiver<RunPhase>,
    every: Duration,
) -> Option<(f64, f64)> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut samples = 0usize;
    loop {
        if !matches!(*phase.borrow(), RunPhase::Running) {
            break;
        }
        let position = state.read().await.position;
        min = min.min(position);
        max = max.max(position);
        samples += 1;
        tokio::select! {
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep(every) => {}
        }
    }
    if samples == 0 {
        None
    } else {
        debug!(min, max, samples, "position span observed during run");
        Some((min, max))
    }
}
