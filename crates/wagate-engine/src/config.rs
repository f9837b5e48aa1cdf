use std::time::Duration;

/// Timing and sizing knobs for instance lifecycles.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub keepalive_interval: Duration,
    /// Delay before the first keep-alive reconciliation after connect.
    pub settle_delay: Duration,
    /// Pause between announcing presence and starting to type.
    pub presence_pause: Duration,
    pub subscriber_capacity: usize,
    pub webhook_timeout: Duration,
    pub defaults: InstanceDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(20),
            settle_delay: Duration::from_secs(3),
            presence_pause: Duration::from_millis(500),
            subscriber_capacity: 10,
            webhook_timeout: Duration::from_secs(10),
            defaults: InstanceDefaults::default(),
        }
    }
}

/// Settings given to freshly created instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceDefaults {
    pub transcription_enabled: bool,
    pub typing_delay_min: u32,
    pub typing_delay_max: u32,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            transcription_enabled: true,
            typing_delay_min: 1000,
            typing_delay_max: 3000,
        }
    }
}
