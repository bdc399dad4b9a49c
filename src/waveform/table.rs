use serde::{Deserialize, Serialize};

/// One device-side motion profile, uploaded to a wave table and played
/// out by the generator. Built fresh for each run and immutable once
/// built.
///
/// `center` and `speed_up_down` are point indices into the table;
/// `amplitude` and `offset` are raw positions in mm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Waveform {
    Sinusoidal {
        center: u32,
        amplitude: f64,
        offset: f64,
        num_points: u32,
    },
    Ramp {
        speed_up_down: u32,
        amplitude: f64,
        offset: f64,
        num_points: u32,
    },
    SmoothedRamp {
        center: u32,
        speed_up_down: u32,
        amplitude: f64,
        offset: f64,
        num_points: u32,
    },
}

impl Waveform {
    /// Sine period with the curve center at the half-way point.
    pub fn sinusoidal(num_points: u32, amplitude: f64, offset: f64) -> Self {
        Waveform::Sinusoidal {
            center: num_points / 2,
            amplitude,
            offset,
            num_points,
        }
    }

    /// Linear ramp with no smoothing segment.
    pub fn ramp(num_points: u32, amplitude: f64, offset: f64) -> Self {
        Waveform::Ramp {
            speed_up_down: 0,
            amplitude,
            offset,
            num_points,
        }
    }

    /// Ramp with smoothed turnarounds: center at 3/4 of the period,
    /// acceleration segments of 1/8 of the period.
    pub fn smoothed_ramp(num_points: u32, amplitude: f64, offset: f64) -> Self {
        Waveform::SmoothedRamp {
            center: num_points * 3 / 4,
            speed_up_down: num_points / 8,
            amplitude,
            offset,
            num_points,
        }
    }

    pub fn num_points(&self) -> u32 {
        match self {
            Waveform::Sinusoidal { num_points, .. }
            | Waveform::Ramp { num_points, .. }
            | Waveform::SmoothedRamp { num_points, .. } => *num_points,
        }
    }

    pub fn amplitude(&self) -> f64 {
        match self {
            Waveform::Sinusoidal { amplitude, .. }
            | Waveform::Ramp { amplitude, .. }
            | Waveform::SmoothedRamp { amplitude, .. } => *amplitude,
        }
    }

    pub fn offset(&self) -> f64 {
        match self {
            Waveform::Sinusoidal { offset, .. }
            | Waveform::Ramp { offset, .. }
            | Waveform::SmoothedRamp { offset, .. } => *offset,
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            Waveform::Sinusoidal { .. } => "sinusoidal",
            Waveform::Ramp { .. } => "ramp",
            Waveform::SmoothedRamp { .. } => "smoothed ramp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinusoidal_centers_at_half_period() {
        let wf = Waveform::sinusoidal(500, 3.0, -1.5);
        assert_eq!(
            wf,
            Waveform::Sinusoidal {
                center: 250,
                amplitude: 3.0,
                offset: -1.5,
                num_points: 500,
            }
        );
    }

    #[test]
    fn smoothed_ramp_segment_defaults() {
        match Waveform::smoothed_ramp(1000, 2.0, 0.0) {
            Waveform::SmoothedRamp {
                center,
                speed_up_down,
                ..
            } => {
                assert_eq!(center, 750);
                assert_eq!(speed_up_down, 125);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }
}
