use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("spell '{spell}' failed to start: {detail}")]
    SpawnFailed { spell: String, detail: String },

    #[error("spell '{spell}' timed out after {seconds}s during {phase}")]
    Timeout {
        spell: String,
        phase: &'static str,
        seconds: u64,
    },

    #[error("spell '{0}' is not active")]
    NotActive(String),

    #[error("tool '{tool}' from spell '{spell}' collides with an already exposed tool")]
    ToolCollision { spell: String, tool: String },

    #[error("auth for spell '{spell}' is unusable: {detail}")]
    Auth { spell: String, detail: String },

    #[error("backend error from spell '{spell}': {detail}")]
    Backend { spell: String, detail: String },
}

impl LifecycleError {
    /// The spell this error is about, for upstream error payloads.
    #[must_use]
    pub fn spell_name(&self) -> &str {
        match self {
            Self::SpawnFailed { spell, .. }
            | Self::Timeout { spell, .. }
            | Self::NotActive(spell)
            | Self::ToolCollision { spell, .. }
            | Self::Auth { spell, .. }
            | Self::Backend { spell, .. } => spell,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
