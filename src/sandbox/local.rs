//! Local sandbox provider: host processes inside a work directory.
//!
//! The project is materialized under the configured work directory and
//! every command runs there with piped output. Readiness is inferred from
//! the first server address a process prints.

use super::{
    detect_server_url, ProcessHandle, Sandbox, SandboxProvider, ServerReady, SpawnedProcess,
    EXIT_UNKNOWN, OUTPUT_BUFFER,
};
use crate::output::{LineSplitter, Utf8Decoder};
use crate::project::vfs::VirtualFilesystemTree;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};

const READ_CHUNK: usize = 4096;

pub struct LocalProvider {
    workdir: PathBuf,
}

impl LocalProvider {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Sandbox>> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .with_context(|| format!("Failed to create work directory {}", self.workdir.display()))?;
        let sandbox: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new(self.workdir.clone()));
        Ok(sandbox)
    }

    fn name(&self) -> &str {
        "local"
    }
}

pub struct LocalSandbox {
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalSandbox {
    pub fn new(root: PathBuf) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self { root, ready_tx }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

struct LocalHandle {
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl ProcessHandle for LocalHandle {
    async fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn mount(&self, tree: &VirtualFilesystemTree) -> anyhow::Result<()> {
        for dir in tree.directories() {
            let target = self.root.join(&dir);
            tokio::fs::create_dir_all(&target)
                .await
                .with_context(|| format!("Failed to create {}", target.display()))?;
        }
        for (path, contents) in tree.files() {
            let target = self.root.join(&path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&target, contents)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))?;
        }
        tracing::debug!(
            "Mounted {} files into {}",
            tree.file_count(),
            self.root.display()
        );
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so kill() also reaches what npm/sh start beneath it.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {command}"))?;
        let pid = child.id();

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let announced = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump(
            stdout,
            out_tx.clone(),
            self.ready_tx.clone(),
            Arc::clone(&announced),
        ));
        tokio::spawn(pump(stderr, out_tx, self.ready_tx.clone(), announced));

        let label = command.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    tracing::debug!("Killing {label}");
                    // The leader is not reaped yet, so its pid still names the group.
                    kill_process_group(pid);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_status_code(status),
                Err(e) => {
                    tracing::warn!("Failed to wait on {label}: {e}");
                    EXIT_UNKNOWN
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            output: out_rx,
            exit: exit_rx,
            handle: Arc::new(LocalHandle {
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    fn id(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Forward raw chunks and announce the first server address seen.
async fn pump<R>(
    mut reader: R,
    out_tx: mpsc::Sender<String>,
    ready_tx: broadcast::Sender<ServerReady>,
    announced: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Output stream closed: {e}");
                break;
            }
        };
        let chunk = decoder.push(&buf[..n]);
        if chunk.is_empty() {
            continue;
        }

        if !announced.load(Ordering::SeqCst) {
            for line in splitter.push(&chunk) {
                if let Some(ready) = detect_server_url(&line) {
                    if !announced.swap(true, Ordering::SeqCst) {
                        tracing::debug!("Server ready at {}", ready.url);
                        let _ = ready_tx.send(ready);
                    }
                    break;
                }
            }
        }

        // Receiver gone: keep draining so the child never blocks on a full pipe.
        let _ = out_tx.send(chunk).await;
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = out_tx.send(rest).await;
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // A negative pid addresses every process in the group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(
            "Failed to kill process group {pgid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(EXIT_UNKNOWN)
}

#[cfg(not(unix))]
fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_UNKNOWN)
}
