//! Typed failures of the preview lifecycle.

use super::state::LifecycleState;
use crate::project::synth::SynthesisError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to boot sandbox: {0}")]
    Boot(#[source] anyhow::Error),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("Failed to mount project: {0}")]
    Mount(#[source] anyhow::Error),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Install failed with exit code {exit_code}")]
    InstallFailed { exit_code: i32 },

    #[error("Dev server exited with code {exit_code}")]
    StartFailed { exit_code: i32 },

    #[error("Sandbox stopped publishing server-ready events")]
    ReadinessClosed,

    #[error("Superseded by restart")]
    Superseded,

    #[error("Another lifecycle operation is in progress")]
    Busy,

    #[error("Session is not ready (state: {0})")]
    NotReady(LifecycleState),
}

impl SessionError {
    /// Process exit code carried by install/start failures.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionError::InstallFailed { exit_code } | SessionError::StartFailed { exit_code } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_preserved_and_rendered() {
        let err = SessionError::InstallFailed { exit_code: 1 };
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(err.to_string(), "Install failed with exit code 1");

        let err = SessionError::StartFailed { exit_code: 137 };
        assert_eq!(err.exit_code(), Some(137));
        assert!(err.to_string().contains("137"));

        assert_eq!(SessionError::Busy.exit_code(), None);
    }

    #[test]
    fn collaborator_errors_keep_their_message() {
        let err = SessionError::Mount(anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "Failed to mount project: disk full");
    }
}
