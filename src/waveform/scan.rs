use serde::{Deserialize, Serialize};

use super::table::Waveform;
use crate::axis::MotionLimits;

/// Servo cycle time of the controller, in seconds. One wave table point
/// lasts `table_rate` servo cycles.
pub const SERVO_CYCLE_SECS: f64 = 200e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Sinusoidal,
    Ramp,
    SmoothedRamp,
}

/// Where the scan trajectory is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPoint {
    NegativeLimit,
    Home,
    PositiveLimit,
}

/// Table-point count derived from the requested scan frequency.
///
/// `num_points = round(1 / (table_rate * servo_cycle * frequency))`.
/// The value is recomputed only when frequency or table rate change and
/// cached for reuse, not rederived per access.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformTiming {
    table_rate: u32,
    frequency_hz: f64,
    num_points: u32,
}

impl WaveformTiming {
    pub fn new(table_rate: u32, frequency_hz: f64) -> Self {
        Self {
            table_rate,
            frequency_hz,
            num_points: Self::derive(table_rate, frequency_hz),
        }
    }

    pub fn set_frequency(&mut self, frequency_hz: f64) {
        self.frequency_hz = frequency_hz;
        self.num_points = Self::derive(self.table_rate, frequency_hz);
    }

    pub fn set_table_rate(&mut self, table_rate: u32) {
        self.table_rate = table_rate;
        self.num_points = Self::derive(table_rate, self.frequency_hz);
    }

    pub fn table_rate(&self) -> u32 {
        self.table_rate
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    fn derive(table_rate: u32, frequency_hz: f64) -> u32 {
        let period = table_rate.max(1) as f64 * SERVO_CYCLE_SECS * frequency_hz;
        (1.0 / period).round().max(1.0) as u32
    }
}

impl Default for WaveformTiming {
    fn default() -> Self {
        Self::new(2, 5.0)
    }
}

/// Consumer-facing description of one periodic-motion program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    pub mode: ScanMode,
    /// Peak-to-peak amplitude in mm.
    pub amplitude: f64,
    pub cycles: u32,
    /// Wave table point duration in servo cycles.
    pub table_rate: u32,
    pub frequency_hz: f64,
    pub start: StartPoint,
    /// Override of the derived curve-center point index.
    #[serde(default)]
    pub center_point: Option<u32>,
    /// Override of the derived acceleration segment length.
    #[serde(default)]
    pub speed_up_down: Option<u32>,
}

impl ScanSettings {
    pub fn sinusoidal(amplitude: f64, cycles: u32) -> Self {
        Self {
            mode: ScanMode::Sinusoidal,
            amplitude,
            cycles,
            table_rate: 2,
            frequency_hz: 5.0,
            start: StartPoint::Home,
            center_point: None,
            speed_up_down: None,
        }
    }

    /// Translate these settings into a device waveform, anchored to the
    /// stage's home offset and travel range.
    ///
    /// Anchoring at the positive limit flips the amplitude so the
    /// trajectory runs back into the range. The sinusoid is laid out
    /// around home; ramps start at the anchor itself.
    pub fn build(&self, timing: &WaveformTiming, home: f64, limits: MotionLimits) -> Waveform {
        let (anchor, amplitude) = match self.start {
            StartPoint::NegativeLimit => (limits.min, self.amplitude),
            StartPoint::Home => (home, self.amplitude),
            StartPoint::PositiveLimit => (limits.max, -self.amplitude),
        };
        let num_points = timing.num_points();

        let mut waveform = match self.mode {
            ScanMode::Sinusoidal => {
                Waveform::sinusoidal(num_points, amplitude, home - amplitude / 2.0)
            }
            ScanMode::Ramp => Waveform::ramp(num_points, amplitude, anchor),
            ScanMode::SmoothedRamp => Waveform::smoothed_ramp(num_points, amplitude, anchor),
        };

        match &mut waveform {
            Waveform::Sinusoidal { center, .. } => {
                if let Some(c) = self.center_point {
                    *center = c;
                }
            }
            Waveform::Ramp { speed_up_down, .. } => {
                if let Some(s) = self.speed_up_down {
                    *speed_up_down = s;
                }
            }
            Waveform::SmoothedRamp {
                center,
                speed_up_down,
                ..
            } => {
                if let Some(c) = self.center_point {
                    *center = c;
                }
                if let Some(s) = self.speed_up_down {
                    *speed_up_down = s;
                }
            }
        }
        waveform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_points_follows_frequency() {
        // 1 / (2 * 200us * 5 Hz) = 500 points
        let mut timing = WaveformTiming::new(2, 5.0);
        assert_eq!(timing.num_points(), 500);

        timing.set_frequency(10.0);
        assert_eq!(timing.num_points(), 250);

        timing.set_table_rate(10);
        assert_eq!(timing.num_points(), 50);
    }

    #[test]
    fn sinusoid_is_laid_out_around_home() {
        let settings = ScanSettings::sinusoidal(3.0, 1);
        let wf = settings.build(
            &WaveformTiming::new(2, 5.0),
            1.0,
            MotionLimits::new(-5.0, 5.0),
        );
        assert_eq!(
            wf,
            Waveform::Sinusoidal {
                center: 250,
                amplitude: 3.0,
                offset: -0.5,
                num_points: 500,
            }
        );
    }

    #[test]
    fn positive_limit_anchor_flips_amplitude() {
        let mut settings = ScanSettings::sinusoidal(2.0, 1);
        settings.mode = ScanMode::Ramp;
        settings.start = StartPoint::PositiveLimit;
        let wf = settings.build(
            &WaveformTiming::default(),
            0.0,
            MotionLimits::new(-5.0, 5.0),
        );
        assert_eq!(wf.amplitude(), -2.0);
        assert_eq!(wf.offset(), 5.0);
    }

    #[test]
    fn overrides_replace_derived_segments() {
        let mut settings = ScanSettings::sinusoidal(2.0, 1);
        settings.mode = ScanMode::SmoothedRamp;
        settings.center_point = Some(300);
        settings.speed_up_down = Some(40);
        let wf = settings.build(
            &WaveformTiming::default(),
            0.0,
            MotionLimits::new(-5.0, 5.0),
        );
        match wf {
            Waveform::SmoothedRamp {
                center,
                speed_up_down,
                ..
            } => {
                assert_eq!(center, 300);
                assert_eq!(speed_up_down, 40);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }
}
