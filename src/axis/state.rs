use super::direction::Direction;

/// Cached per-axis telemetry. Mutated only by the controller: command
/// completions update `direction` and `home`, the poll loop refreshes
/// `position` and `on_target`.
#[derive(Debug, Clone)]
pub struct AxisState {
    /// Raw device position in mm (not offset-corrected).
    pub position: f64,
    pub on_target: bool,
    pub servo_enabled: bool,
    /// Closed-loop velocity in mm/s.
    pub velocity: f64,
    /// Raw position recorded as the logical zero.
    pub home: f64,
    /// Sign of the last commanded displacement, for backlash correction.
    pub direction: Direction,
}

impl AxisState {
    /// Position relative to the stored home offset.
    pub fn relative_position(&self) -> f64 {
        self.position - self.home
    }
}

impl Default for AxisState {
    fn default() -> Self {
        Self {
            position: 0.0,
            on_target: false,
            servo_enabled: false,
            velocity: 0.0,
            home: 0.0,
            direction: Direction::Positive,
        }
    }
}
