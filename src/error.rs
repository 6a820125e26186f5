use std::time::Duration;

use thiserror::Error;

/// Why a session ended. A session never ends successfully: restarting is left
/// to the process supervisor, so every variant maps to a non-zero exit code.
#[derive(Debug, Error)]
pub enum SessionExit {
    #[error("waited too long for data ({cycles} idle polls)")]
    IdleExhausted { cycles: u32 },

    #[error("hard deadline of {}s fired while waiting for the transport", .0.as_secs())]
    HardDeadline(Duration),

    #[error("transport disconnected")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("inbound event handling failed: {0:#}")]
    Handler(anyhow::Error),
}

impl SessionExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionExit::Handler(_) => 1,
            SessionExit::IdleExhausted { .. } => 3,
            SessionExit::HardDeadline(_) => 4,
            SessionExit::Disconnected => 5,
            SessionExit::Transport(_) => 6,
        }
    }
}

impl From<anyhow::Error> for SessionExit {
    fn from(err: anyhow::Error) -> Self {
        SessionExit::Handler(err)
    }
}
