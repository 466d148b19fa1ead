//! Hot-Reload Coordinator.
//!
//! Every file-tree change is fingerprinted and routed to the cheapest stage
//! that picks it up:
//!
//! | session state                    | action                      |
//! |----------------------------------|-----------------------------|
//! | unchanged fingerprint            | nothing                     |
//! | `ready`                          | synthesize + remount        |
//! | `idle`                           | full boot cycle             |
//! | `error`                          | restart                     |
//! | `booting`/`installing`/`starting`| deferred, kept as pending   |

use crate::project::ProjectFileTree;
use crate::session::{LifecycleState, SandboxSession, SessionError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Characters of each file folded into the fingerprint verbatim.
pub const PREFIX_CHARS: usize = 64;

/// Structural fingerprint of a tree.
///
/// One record per file in traversal order: path, byte length, the first
/// `min(len, PREFIX_CHARS)` characters, and a SHA-256 of the full content.
/// The records are hashed together and hex-encoded.
pub fn fingerprint(tree: &ProjectFileTree) -> String {
    let mut hasher = Sha256::new();
    for (path, node) in tree.files() {
        let content = node.text();
        let prefix: String = content.chars().take(PREFIX_CHARS).collect();
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(content.len().to_le_bytes());
        hasher.update(prefix.as_bytes());
        hasher.update([0]);
        hasher.update(Sha256::digest(content.as_bytes()));
    }
    hex::encode(hasher.finalize())
}

/// What a change did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Fingerprint matched the last one seen.
    Unchanged,
    /// Files were remounted into the running sandbox.
    Remounted { files: usize },
    /// Remount failed; the session keeps serving the previous build.
    RemountFailed { message: String },
    /// A boot cycle ran from `idle` and ended in this state.
    Booted(LifecycleState),
    /// A restart ran from `error` and ended in this state.
    Restarted(LifecycleState),
    /// A cycle is in flight; the tree is kept for [`HotReloadCoordinator::apply_pending`].
    Deferred,
}

pub struct HotReloadCoordinator {
    session: Arc<SandboxSession>,
    pending: Mutex<Option<ProjectFileTree>>,
}

impl HotReloadCoordinator {
    pub fn new(session: Arc<SandboxSession>) -> Self {
        Self {
            session,
            pending: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<SandboxSession> {
        &self.session
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Route a changed tree. Boot and mount failures of a full cycle are
    /// returned so the caller can offer a retry.
    pub async fn on_change(&self, tree: &ProjectFileTree) -> Result<ReloadOutcome, SessionError> {
        let print = fingerprint(tree);
        if self.session.fingerprint().as_deref() == Some(print.as_str()) {
            return Ok(ReloadOutcome::Unchanged);
        }

        let state = self.session.state();
        if state.is_in_flight() {
            tracing::debug!("Session is {state}, deferring change");
            return Ok(self.defer(tree));
        }
        // This tree supersedes anything deferred before it arrived.
        self.pending.lock().take();

        match state {
            LifecycleState::Ready => match self.session.remount(tree).await {
                Ok(files) => {
                    self.settle(print);
                    Ok(ReloadOutcome::Remounted { files })
                }
                Err(SessionError::Busy | SessionError::NotReady(_)) => Ok(self.defer(tree)),
                Err(e) => {
                    self.settle(print);
                    Ok(ReloadOutcome::RemountFailed {
                        message: e.to_string(),
                    })
                }
            },
            LifecycleState::Idle => {
                if tree.is_empty() {
                    return Ok(ReloadOutcome::Unchanged);
                }
                let result = self.session.boot_and_run(tree).await;
                self.settle(print);
                result.map(ReloadOutcome::Booted)
            }
            _ => self
                .restart_with(tree, print)
                .await
                .map(ReloadOutcome::Restarted),
        }
    }

    /// Explicit restart requested by the user.
    pub async fn restart(&self, tree: &ProjectFileTree) -> Result<LifecycleState, SessionError> {
        self.restart_with(tree, fingerprint(tree)).await
    }

    /// Replay the newest deferred tree once the session has settled.
    /// Returns `None` when nothing is pending.
    pub async fn apply_pending(&self) -> Option<Result<ReloadOutcome, SessionError>> {
        let tree = self.pending.lock().take()?;
        if self.session.state().is_in_flight() {
            *self.pending.lock() = Some(tree);
            return Some(Ok(ReloadOutcome::Deferred));
        }
        tracing::debug!("Applying deferred change");
        Some(self.on_change(&tree).await)
    }

    async fn restart_with(
        &self,
        tree: &ProjectFileTree,
        print: String,
    ) -> Result<LifecycleState, SessionError> {
        let result = self.session.restart(tree).await;
        self.settle(print);
        result
    }

    fn settle(&self, print: String) {
        self.session.record_fingerprint(print);
    }

    fn defer(&self, tree: &ProjectFileTree) -> ReloadOutcome {
        *self.pending.lock() = Some(tree.clone());
        ReloadOutcome::Deferred
    }
}
