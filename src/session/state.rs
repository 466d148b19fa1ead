//! Lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Idle,
    Booting,
    Installing,
    Starting,
    Ready,
    Error,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Idle,
        LifecycleState::Booting,
        LifecycleState::Installing,
        LifecycleState::Starting,
        LifecycleState::Ready,
        LifecycleState::Error,
    ];

    /// Whether `self → next` is an edge of the lifecycle graph:
    ///
    /// ```text
    /// idle → booting → installing → starting → ready
    ///           ↓           ↓            ↓        ↓
    ///           └───────────┴─── error ──┴────────┘
    /// ready | error → idle   (restart)
    /// ```
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Booting)
                | (Booting, Installing)
                | (Booting, Error)
                | (Installing, Starting)
                | (Installing, Error)
                | (Starting, Ready)
                | (Starting, Error)
                | (Ready, Error)
                | (Ready, Idle)
                | (Error, Idle)
        )
    }

    /// A boot cycle is running and has not resolved yet.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            LifecycleState::Booting | LifecycleState::Installing | LifecycleState::Starting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Booting => "booting",
            LifecycleState::Installing => "installing",
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::Error => "error",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
