use std::time::Duration;

use crate::port::ReferenceMode;

/// Per-model constants for the supported stages. One controller
/// parameterized by a model record replaces per-model wrapper code.
#[derive(Debug, Clone, PartialEq)]
pub struct StageModel {
    pub name: String,
    /// Hard velocity ceiling in mm/s.
    pub max_velocity: f64,
    pub reference_mode: ReferenceMode,
}

impl StageModel {
    /// Known stage models and their velocity ceilings.
    pub fn known(name: &str) -> Option<Self> {
        let max_velocity = match name {
            "M-405.CG" => 0.7,
            "M-403.4DG" => 2.5,
            "L-402.10SD" => 5.0,
            "V-524.1AA" => 250.0,
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            max_velocity,
            reference_mode: ReferenceMode::Center,
        })
    }

    /// Model record for a stage not in the table. No reference move is
    /// performed for an unknown stage.
    pub fn generic(name: &str, max_velocity: f64) -> Self {
        Self {
            name: name.to_string(),
            max_velocity,
            reference_mode: ReferenceMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Axis identifier on the controller, usually "1".
    pub axis_id: String,
    /// Motion controller the stage is cabled to (informational).
    pub controller_model: String,
    /// Serial number or address handed to the port on connect.
    pub port_identifier: String,
    pub model: StageModel,
    pub reference_mode: ReferenceMode,
    /// Allowed closed-loop velocity range in mm/s; requests outside it
    /// are clamped.
    pub velocity_range: (f64, f64),
    /// Dither magnitude for backlash correction, in mm.
    pub backlash_delta: f64,
    pub poll_interval: Duration,
    /// Hard safety bound on one waveform-generator run.
    pub waveform_safety_timeout: Duration,
}

impl StageConfig {
    pub fn new(port_identifier: &str, model: StageModel) -> Self {
        let reference_mode = model.reference_mode;
        let max_velocity = model.max_velocity;
        Self {
            axis_id: "1".to_string(),
            controller_model: "C-413.2GA".to_string(),
            port_identifier: port_identifier.to_string(),
            model,
            reference_mode,
            velocity_range: (0.01, max_velocity),
            backlash_delta: 0.05,
            poll_interval: Duration::from_millis(50),
            waveform_safety_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_axis_id(mut self, axis_id: &str) -> Self {
        self.axis_id = axis_id.to_string();
        self
    }

    pub fn with_reference_mode(mut self, mode: ReferenceMode) -> Self {
        self.reference_mode = mode;
        self
    }

    pub fn with_velocity_range(mut self, min: f64, max: f64) -> Self {
        self.velocity_range = (min, max);
        self
    }

    pub fn with_backlash_delta(mut self, delta: f64) -> Self {
        self.backlash_delta = delta;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_waveform_safety_timeout(mut self, timeout: Duration) -> Self {
        self.waveform_safety_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_reference_via_center_switch() {
        let model = StageModel::known("V-524.1AA").unwrap();
        assert_eq!(model.max_velocity, 250.0);
        assert_eq!(model.reference_mode, ReferenceMode::Center);
        assert!(StageModel::known("X-999").is_none());
    }

    #[test]
    fn velocity_range_defaults_to_model_ceiling() {
        let config = StageConfig::new("0135500826", StageModel::known("M-405.CG").unwrap());
        assert_eq!(config.velocity_range, (0.01, 0.7));
    }
}
