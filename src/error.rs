//! Errors surfaced to the control surface.
//!
//! Everything recoverable stays inside its owning component; only these reach
//! callers of [`crate::session::SessionController`].

/// Configuration rejected at `Start`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    NonPositive { key: &'static str },

    #[error("min_interval_secs ({min}) cannot be greater than max_interval_secs ({max})")]
    IntervalOrder { min: u64, max: u64 },

    #[error("{upper_key} ({upper}) must be greater than {lower_key} ({lower})")]
    ThresholdOrder {
        lower_key: &'static str,
        lower: u64,
        upper_key: &'static str,
        upper: u64,
    },

    #[error("target_percentage must be between 1 and 100, got {0}")]
    TargetOutOfRange(u8),

    #[error("every_nth for {category} must be at least 1")]
    ZeroFrequency { category: &'static str },
}

/// Errors returned by session control commands.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("a session is already running")]
    AlreadyRunning,

    #[error("no session is running")]
    NotRunning,

    #[error("session internals failed: {0}")]
    Internal(#[from] anyhow::Error),
}
