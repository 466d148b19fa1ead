//! Sandbox abstraction layer.
//!
//! Defines the [`SandboxProvider`] and [`Sandbox`] traits that every
//! execution backend implements, mirroring the capability surface a host
//! sandbox exposes: boot, mount, spawn, and a server-ready event.
//! Two providers exist:
//!
//! - [`local::LocalSandbox`]: host processes inside a work directory
//! - [`docker::DockerSandbox`]: local Docker container (no API key needed)
//!
//! [`SandboxContext`] owns the single shared instance. [`create_provider`]
//! picks the provider from configuration.

pub mod docker;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use crate::config::{PreviewConfig, ProviderKind};
use crate::project::vfs::VirtualFilesystemTree;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Exit code reported when a process vanished without reporting one.
pub const EXIT_UNKNOWN: i32 = -1;

/// Buffered output chunks per spawned process.
pub const OUTPUT_BUFFER: usize = 256;

/// Emitted by a sandbox when a dev server starts accepting connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    /// Address reachable from outside the sandbox.
    pub url: String,
}

/// Handle used to terminate a spawned process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Terminate the process. Idempotent; a no-op when already dead and
    /// never fails.
    async fn kill(&self);
}

/// A process running inside a sandbox.
pub struct SpawnedProcess {
    /// Raw output chunks, stdout and stderr combined, not split on lines.
    /// Closed when the process's output ends.
    pub output: mpsc::Receiver<String>,
    /// Resolves once with the exit code.
    pub exit: oneshot::Receiver<i32>,
    pub handle: Arc<dyn ProcessHandle>,
}

/// Wait for an exit code; a dropped sender counts as [`EXIT_UNKNOWN`].
pub async fn exit_code(exit: oneshot::Receiver<i32>) -> i32 {
    exit.await.unwrap_or(EXIT_UNKNOWN)
}

/// A booted sandbox instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Write the tree into the sandbox filesystem. Existing files at the
    /// same paths are overwritten; other files are left in place.
    async fn mount(&self, tree: &VirtualFilesystemTree) -> anyhow::Result<()>;

    /// Start `command args...` in the project root.
    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SpawnedProcess>;

    /// Subscribe to server-ready events. Dropping the receiver unsubscribes,
    /// so per-cycle subscriptions never accumulate.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Short identifier for logs.
    fn id(&self) -> String;

    /// Tear down host resources held by the instance.
    async fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Boots sandbox instances.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Sandbox>>;

    fn name(&self) -> &str;
}

/// Owner of the process-wide sandbox instance.
///
/// The instance is created lazily by [`acquire`](Self::acquire). Concurrent
/// callers wait on the same boot attempt instead of starting a second one.
/// Only [`reset`](Self::reset) drops it.
pub struct SandboxContext {
    provider: Arc<dyn SandboxProvider>,
    instance: tokio::sync::Mutex<Option<Arc<dyn Sandbox>>>,
}

impl SandboxContext {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            instance: tokio::sync::Mutex::new(None),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Return the shared instance, booting it on first use.
    pub async fn acquire(&self) -> anyhow::Result<Arc<dyn Sandbox>> {
        let mut slot = self.instance.lock().await;
        if let Some(sandbox) = slot.as_ref() {
            return Ok(Arc::clone(sandbox));
        }

        tracing::info!("Booting {} sandbox", self.provider.name());
        let sandbox = self.provider.boot().await?;
        tracing::info!("Sandbox {} booted", sandbox.id());
        *slot = Some(Arc::clone(&sandbox));
        Ok(sandbox)
    }

    /// The instance, if booted and not currently being booted.
    pub fn current(&self) -> Option<Arc<dyn Sandbox>> {
        self.instance.try_lock().ok().and_then(|slot| slot.clone())
    }

    /// Drop the shared instance; the next [`acquire`](Self::acquire) boots
    /// a fresh one. Returns the dropped instance.
    pub async fn reset(&self) -> Option<Arc<dyn Sandbox>> {
        let dropped = self.instance.lock().await.take();
        if let Some(sandbox) = &dropped {
            tracing::info!("Released sandbox {}", sandbox.id());
        }
        dropped
    }
}

/// Build the provider selected in `config`.
pub fn create_provider(config: &PreviewConfig) -> anyhow::Result<Arc<dyn SandboxProvider>> {
    let provider: Arc<dyn SandboxProvider> = match config.sandbox.provider {
        ProviderKind::Local => Arc::new(local::LocalProvider::new(config.workdir())),
        ProviderKind::Docker => Arc::new(docker::DockerProvider::new(
            &config.sandbox.image,
            config.sandbox.port,
        )?),
    };
    Ok(provider)
}

fn server_url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{1,5}))")
                .map_err(|e| tracing::warn!("Server URL detection disabled: {e}"))
                .ok()
        })
        .as_ref()
}

/// Find a dev-server address announced in a line of output, e.g. Vite's
/// `➜  Local:   http://localhost:5173/`.
pub fn detect_server_url(line: &str) -> Option<ServerReady> {
    let text = crate::output::clean(line);
    let caps = server_url_pattern()?.captures(&text)?;
    let port: u16 = caps.get(2)?.as_str().parse().ok()?;
    let url = caps.get(1)?.as_str().replace("0.0.0.0", "localhost");
    Some(ServerReady { port, url })
}
