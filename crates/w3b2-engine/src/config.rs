use std::time::Duration;

/// Runtime knobs of the engine. The gateway fills these from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sessions idle for longer than this expire.
    pub session_idle: Duration,
    /// How long a dispatch may stay in `AwaitingConfirmation`.
    pub confirmation_timeout: Duration,
    /// First reconnect delay of the chain listener.
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
    /// Per-subscriber notification buffer.
    pub notification_buffer: usize,
    /// Maximum events applied in one mirror transaction.
    pub apply_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_idle: Duration::from_secs(900),
            confirmation_timeout: Duration::from_secs(120),
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
            notification_buffer: 256,
            apply_batch_size: 64,
        }
    }
}
