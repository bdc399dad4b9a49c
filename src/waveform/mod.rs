pub mod run;
pub mod scan;
pub mod table;

pub use run::{GeneratorRun, RunHandle, RunOutcome, RunPhase, RunStats};
pub use scan::{ScanMode, ScanSettings, StartPoint, WaveformTiming};
pub use table::Waveform;
