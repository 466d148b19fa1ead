//! Scripted in-memory sandbox for session and hot-reload tests.

use super::{ProcessHandle, Sandbox, SandboxProvider, ServerReady, SpawnedProcess, OUTPUT_BUFFER};
use crate::project::vfs::VirtualFilesystemTree;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

/// Exit code reported for killed mock processes.
pub(crate) const KILLED: i32 = 143;

/// What a spawned mock process does.
#[derive(Clone, Default)]
pub(crate) struct ProcessScript {
    pub output: Vec<String>,
    /// `None` runs until killed.
    pub exit_code: Option<i32>,
    /// Published on the ready channel after the output is written.
    pub ready_url: Option<String>,
    /// Exit code reported some time after readiness (a later crash).
    pub crash_after_ready: Option<i32>,
    /// Process waits for this before producing anything.
    pub gate: Option<Arc<Notify>>,
}

impl ProcessScript {
    pub fn install_ok() -> Self {
        Self {
            output: vec!["added 3 packages in 1s".to_string()],
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn install_failing(code: i32) -> Self {
        Self {
            output: vec!["npm ERR! code E404".to_string()],
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn dev_ready() -> Self {
        Self {
            output: vec![
                "VITE v5.0.8  ready in 200 ms".to_string(),
                "➜  Local:   http://localhost:3000/".to_string(),
            ],
            ready_url: Some("http://localhost:3000".to_string()),
            ..Self::default()
        }
    }
}

struct MockHandle {
    kills: Arc<AtomicUsize>,
    journal: Arc<Mutex<Vec<String>>>,
    exit: Mutex<Option<oneshot::Sender<i32>>>,
}

#[async_trait]
impl ProcessHandle for MockHandle {
    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push("kill".to_string());
        if let Some(tx) = self.exit.lock().take() {
            let _ = tx.send(KILLED);
        }
    }
}

pub(crate) struct MockSandbox {
    mounts: AtomicUsize,
    spawns: Mutex<Vec<String>>,
    kills: Arc<AtomicUsize>,
    journal: Arc<Mutex<Vec<String>>>,
    fail_mount: AtomicBool,
    install: Mutex<ProcessScript>,
    dev: Mutex<ProcessScript>,
    ready_tx: broadcast::Sender<ServerReady>,
    last_mount: Mutex<Option<VirtualFilesystemTree>>,
}

impl MockSandbox {
    pub fn new() -> Arc<Self> {
        let (ready_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            mounts: AtomicUsize::new(0),
            spawns: Mutex::new(Vec::new()),
            kills: Arc::new(AtomicUsize::new(0)),
            journal: Arc::new(Mutex::new(Vec::new())),
            fail_mount: AtomicBool::new(false),
            install: Mutex::new(ProcessScript::install_ok()),
            dev: Mutex::new(ProcessScript::dev_ready()),
            ready_tx,
            last_mount: Mutex::new(None),
        })
    }

    pub fn set_install(&self, script: ProcessScript) {
        *self.install.lock() = script;
    }

    pub fn set_dev(&self, script: ProcessScript) {
        *self.dev.lock() = script;
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> Vec<String> {
        self.spawns.lock().clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Spawns (`spawn:<command line>`) and kills in the order they happened.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn last_mount(&self) -> Option<VirtualFilesystemTree> {
        self.last_mount.lock().clone()
    }

    pub fn ready_subscribers(&self) -> usize {
        self.ready_tx.receiver_count()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn mount(&self, tree: &VirtualFilesystemTree) -> anyhow::Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        anyhow::ensure!(!self.fail_mount.load(Ordering::SeqCst), "mount rejected");
        *self.last_mount.lock() = Some(tree.clone());
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.journal.lock().push(format!("spawn:{line}"));
        self.spawns.lock().push(line);

        let script = if args.iter().any(|a| a == "install") {
            self.install.lock().clone()
        } else {
            self.dev.lock().clone()
        };

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = Arc::new(MockHandle {
            kills: Arc::clone(&self.kills),
            journal: Arc::clone(&self.journal),
            exit: Mutex::new(Some(exit_tx)),
        });

        let task_handle = Arc::clone(&handle);
        let ready_tx = self.ready_tx.clone();
        tokio::spawn(async move {
            if let Some(gate) = &script.gate {
                gate.notified().await;
            }
            for line in &script.output {
                if out_tx.send(format!("{line}\n")).await.is_err() {
                    break;
                }
            }
            drop(out_tx);
            if let Some(url) = &script.ready_url {
                let port = url.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0);
                let _ = ready_tx.send(ServerReady {
                    port,
                    url: url.clone(),
                });
            }
            if let Some(code) = script.crash_after_ready {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(tx) = task_handle.exit.lock().take() {
                    let _ = tx.send(code);
                }
            }
            if let Some(code) = script.exit_code {
                if let Some(tx) = task_handle.exit.lock().take() {
                    let _ = tx.send(code);
                }
            }
        });

        Ok(SpawnedProcess {
            output: out_rx,
            exit: exit_rx,
            handle,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    fn id(&self) -> String {
        "mock-sandbox".to_string()
    }
}

pub(crate) struct MockProvider {
    sandbox: Arc<MockSandbox>,
    boots: AtomicUsize,
    fail_first: AtomicUsize,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new(sandbox: Arc<MockSandbox>) -> Self {
        Self {
            sandbox,
            boots: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_boots(self, count: usize) -> Self {
        self.fail_first.store(count, Ordering::SeqCst);
        self
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Sandbox>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let attempt = self.boots.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(
            attempt >= self.fail_first.load(Ordering::SeqCst),
            "boot refused by host"
        );
        let sandbox: Arc<dyn Sandbox> = self.sandbox.clone();
        Ok(sandbox)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
