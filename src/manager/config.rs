use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long cached readback responses stay valid.
    pub default_ttl: Duration,
    pub cache_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_millis(250),
            cache_capacity: 1024,
        }
    }
}
