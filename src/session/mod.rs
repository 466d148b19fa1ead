//! Sandbox Session Manager.
//!
//! [`SandboxSession`] drives one project through
//! `idle → booting → installing → starting → ready` against the shared
//! sandbox held by a [`SandboxContext`], keeps the classified terminal log,
//! and owns the dev-server process handle.
//!
//! Only one boot cycle runs at a time. [`SandboxSession::boot_and_run`]
//! returns immediately when a cycle is already running;
//! [`SandboxSession::restart`] kills the dev server, waits for the running
//! cycle to resolve, and starts a fresh one. The dev server's output is
//! consumed by a detached task for as long as the process lives.

pub mod error;
pub mod state;

pub use error::SessionError;
pub use state::LifecycleState;

use crate::output::{self, LineSplitter, TerminalLine};
use crate::preview::{PreviewSnapshot, SessionEvent};
use crate::project::synth::{synthesize, SynthOptions};
use crate::project::ProjectFileTree;
use crate::sandbox::{
    exit_code, ProcessHandle, Sandbox, SandboxContext, SpawnedProcess, EXIT_UNKNOWN,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Buffered session events per subscriber.
const EVENT_BUFFER: usize = 1024;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// First element is the program; an empty slice gives an empty program.
    pub fn from_argv(argv: &[String]) -> Self {
        match argv.split_first() {
            Some((program, args)) => Self {
                program: program.clone(),
                args: args.to_vec(),
            },
            None => Self {
                program: String::new(),
                args: Vec::new(),
            },
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub install: CommandSpec,
    pub dev: CommandSpec,
    pub synth: SynthOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            install: CommandSpec::new("npm", &["install"]),
            dev: CommandSpec::new("npm", &["run", "dev"]),
            synth: SynthOptions::default(),
        }
    }
}

struct DevServer {
    generation: u64,
    handle: Arc<dyn ProcessHandle>,
}

#[derive(Default)]
struct Inner {
    state: LifecycleState,
    log: Vec<TerminalLine>,
    endpoint: Option<String>,
    error: Option<String>,
    exit_code: Option<i32>,
    fingerprint: Option<String>,
    /// Install process of the running cycle, for shutdown.
    install: Option<Arc<dyn ProcessHandle>>,
    dev: Option<DevServer>,
}

enum StartOutcome {
    Ready(String),
    Exited(i32),
    Closed,
}

pub struct SandboxSession {
    context: Arc<SandboxContext>,
    options: SessionOptions,
    inner: Mutex<Inner>,
    /// Held for the whole of a boot cycle and during a remount.
    cycle: tokio::sync::Mutex<()>,
    /// Bumped by every restart; a cycle that sees it move gives up.
    epoch: AtomicU64,
    dev_generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SandboxSession {
    pub fn new(context: Arc<SandboxContext>, options: SessionOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            context,
            options,
            inner: Mutex::new(Inner::default()),
            cycle: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            dev_generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn log(&self) -> Vec<TerminalLine> {
        self.inner.lock().log.clone()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.inner.lock().endpoint.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Exit code of the failed install or dev-server process, while in `error`.
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }

    /// Fingerprint of the last tree the hot-reload path acted on.
    pub fn fingerprint(&self) -> Option<String> {
        self.inner.lock().fingerprint.clone()
    }

    pub fn record_fingerprint(&self, fingerprint: String) {
        self.inner.lock().fingerprint = Some(fingerprint);
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        let inner = self.inner.lock();
        PreviewSnapshot {
            state: inner.state,
            log: inner.log.clone(),
            endpoint: inner.endpoint.clone(),
            error: inner.error.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Run a full boot cycle for `tree` if the session is idle.
    ///
    /// A no-op returning the current state when a cycle is already in
    /// progress, when the session is not idle, or when `tree` is empty.
    /// Install and start failures resolve to `Ok(LifecycleState::Error)`;
    /// boot, synthesis, mount and spawn failures are also returned as `Err`.
    pub async fn boot_and_run(
        self: &Arc<Self>,
        tree: &ProjectFileTree,
    ) -> Result<LifecycleState, SessionError> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!("Boot already in progress, ignoring request");
            return Ok(self.state());
        };
        let state = self.state();
        if state != LifecycleState::Idle {
            tracing::debug!("Session is {state}, ignoring boot request");
            return Ok(state);
        }
        if tree.is_empty() {
            tracing::debug!("Empty project tree, nothing to boot");
            return Ok(state);
        }
        self.run_cycle(tree).await
    }

    /// Kill the dev server, wait for any running cycle, tear down and boot
    /// again.
    pub async fn restart(
        self: &Arc<Self>,
        tree: &ProjectFileTree,
    ) -> Result<LifecycleState, SessionError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_dev_server().await;

        let _cycle = self.cycle.lock().await;
        tracing::info!("Restarting session");
        self.stop_dev_server().await;
        {
            let mut inner = self.inner.lock();
            inner.endpoint = None;
            inner.fingerprint = None;
            if inner.state != LifecycleState::Idle {
                self.transition(&mut inner, LifecycleState::Idle);
            }
        }
        if tree.is_empty() {
            return Ok(self.state());
        }
        self.run_cycle(tree).await
    }

    /// Synthesize `tree` and mount it into the running sandbox without
    /// reinstalling or restarting the dev server. Failures are logged as an
    /// error line and leave the lifecycle state untouched.
    pub async fn remount(&self, tree: &ProjectFileTree) -> Result<usize, SessionError> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            return Err(SessionError::Busy);
        };
        let state = self.state();
        if state != LifecycleState::Ready {
            return Err(SessionError::NotReady(state));
        }

        let result = async {
            let synthesis = synthesize(tree, &self.options.synth)?;
            let sandbox = self.context.acquire().await.map_err(SessionError::Boot)?;
            sandbox
                .mount(&synthesis.vfs)
                .await
                .map_err(SessionError::Mount)?;
            Ok(synthesis.vfs.file_count())
        }
        .await;

        match &result {
            Ok(count) => {
                tracing::info!("Hot reload mounted {count} files");
                self.push(TerminalLine::success(format!("Reloaded {count} files")));
            }
            Err(e) => {
                tracing::warn!("Hot reload failed: {e}");
                self.push(TerminalLine::error(format!("Reload failed: {e}")));
            }
        }
        result
    }

    /// Kill the install and dev server processes and release the sandbox
    /// instance. Safe to call after an in-flight cycle was dropped.
    pub async fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let install = self.inner.lock().install.take();
        if let Some(handle) = install {
            tracing::info!("Killing install");
            handle.kill().await;
        }
        self.stop_dev_server().await;
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, LifecycleState::Ready | LifecycleState::Error) {
                self.transition(&mut inner, LifecycleState::Idle);
            }
        }
        if let Some(sandbox) = self.context.reset().await {
            if let Err(e) = sandbox.release().await {
                tracing::warn!("Failed to release sandbox {}: {e}", sandbox.id());
            }
        }
    }

    async fn run_cycle(
        self: &Arc<Self>,
        tree: &ProjectFileTree,
    ) -> Result<LifecycleState, SessionError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            if !inner.log.is_empty() {
                inner.log.clear();
                self.emit(SessionEvent::LogCleared);
            }
            inner.error = None;
            inner.exit_code = None;
            self.transition(&mut inner, LifecycleState::Booting);
        }

        self.push(TerminalLine::info(format!(
            "Booting {} sandbox",
            self.context.provider_name()
        )));
        let sandbox = match self.context.acquire().await {
            Ok(sandbox) => sandbox,
            Err(e) => return Err(self.fail(SessionError::Boot(e))),
        };

        let synthesis = match synthesize(tree, &self.options.synth) {
            Ok(synthesis) => synthesis,
            Err(e) => return Err(self.fail(e.into())),
        };
        if let Err(e) = sandbox.mount(&synthesis.vfs).await {
            return Err(self.fail(SessionError::Mount(e)));
        }
        self.push(TerminalLine::success(format!(
            "Mounted {} files",
            synthesis.vfs.file_count()
        )));
        self.set_state(LifecycleState::Installing);

        let install = &self.options.install;
        let SpawnedProcess {
            output,
            exit,
            handle,
        } = self.spawn(&sandbox, install).await?;
        self.inner.lock().install = Some(handle);
        self.drain_output(output, None).await;
        let code = exit_code(exit).await;
        self.inner.lock().install = None;
        if self.superseded(epoch) {
            self.fail(SessionError::Superseded);
            return Ok(self.state());
        }
        if code != 0 {
            self.fail(SessionError::InstallFailed { exit_code: code });
            return Ok(self.state());
        }
        self.push(TerminalLine::success("Dependencies installed"));
        self.set_state(LifecycleState::Starting);

        self.stop_dev_server().await;
        // Subscribed before the spawn so an early announcement is not missed;
        // dropped when this cycle returns.
        let mut ready = sandbox.server_ready();
        let process = self.spawn(&sandbox, &self.options.dev).await?;
        let (generation, mut exited) = self.watch_dev_server(process);

        let outcome = loop {
            tokio::select! {
                event = ready.recv() => match event {
                    Ok(event) => break StartOutcome::Ready(event.url),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break StartOutcome::Closed,
                },
                code = &mut exited => break StartOutcome::Exited(code.unwrap_or(EXIT_UNKNOWN)),
            }
        };

        match outcome {
            StartOutcome::Ready(url) => self.mark_ready(generation, url),
            StartOutcome::Exited(code) => {
                if self.state() == LifecycleState::Starting {
                    if self.superseded(epoch) {
                        self.fail(SessionError::Superseded);
                    } else {
                        self.fail(SessionError::StartFailed { exit_code: code });
                    }
                }
            }
            StartOutcome::Closed => {
                self.stop_dev_server().await;
                self.fail(SessionError::ReadinessClosed);
            }
        }
        Ok(self.state())
    }

    async fn spawn(
        &self,
        sandbox: &Arc<dyn Sandbox>,
        command: &CommandSpec,
    ) -> Result<SpawnedProcess, SessionError> {
        self.push(TerminalLine::command(command.to_string()));
        tracing::info!("Running `{command}` in {}", sandbox.id());
        sandbox
            .spawn(&command.program, &command.args)
            .await
            .map_err(|source| {
                self.fail(SessionError::Spawn {
                    command: command.to_string(),
                    source,
                })
            })
    }

    /// Park the dev server handle and consume its output in the background.
    /// The returned receiver resolves with the exit code.
    fn watch_dev_server(self: &Arc<Self>, process: SpawnedProcess) -> (u64, oneshot::Receiver<i32>) {
        let SpawnedProcess {
            output,
            exit,
            handle,
        } = process;
        let generation = self.dev_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.lock().dev = Some(DevServer { generation, handle });

        let (exited_tx, exited_rx) = oneshot::channel();
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            session.drain_output(output, Some(generation)).await;
            let code = exit_code(exit).await;
            session.dev_server_exited(generation, code);
            let _ = exited_tx.send(code);
        });
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!("Dev server output task failed: {e}");
            }
        });

        (generation, exited_rx)
    }

    async fn drain_output(&self, mut output: mpsc::Receiver<String>, generation: Option<u64>) {
        let mut splitter = LineSplitter::new();
        while let Some(chunk) = output.recv().await {
            for line in splitter.push(&chunk) {
                self.append_output(&line, generation);
            }
        }
        if let Some(rest) = splitter.finish() {
            self.append_output(&rest, generation);
        }
    }

    /// Dev server lines are dropped once their process is no longer the
    /// current one.
    fn append_output(&self, raw: &str, generation: Option<u64>) {
        let mut inner = self.inner.lock();
        if let Some(generation) = generation {
            if !is_current(&inner, generation) {
                return;
            }
        }
        let line = output::classify(raw);
        tracing::debug!("[{:?}] {}", line.kind, line.text);
        inner.log.push(line.clone());
        self.emit(SessionEvent::Line(line));
    }

    fn dev_server_exited(&self, generation: u64, code: i32) {
        let mut inner = self.inner.lock();
        if !is_current(&inner, generation) {
            tracing::debug!("Stopped dev server exited with code {code}");
            return;
        }
        inner.dev = None;
        match inner.state {
            LifecycleState::Starting => {
                self.fail_locked(&mut inner, SessionError::StartFailed { exit_code: code });
            }
            LifecycleState::Ready if code != 0 => {
                self.fail_locked(&mut inner, SessionError::StartFailed { exit_code: code });
            }
            _ => {
                tracing::info!("Dev server exited with code {code}");
                let line = TerminalLine::info(format!("Dev server exited with code {code}"));
                inner.log.push(line.clone());
                self.emit(SessionEvent::Line(line));
            }
        }
    }

    fn mark_ready(&self, generation: u64, url: String) {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Starting || !is_current(&inner, generation) {
            return;
        }
        if self.transition(&mut inner, LifecycleState::Ready) {
            tracing::info!("Preview ready at {url}");
            let line = TerminalLine::success(format!("Preview ready at {url}"));
            inner.log.push(line.clone());
            self.emit(SessionEvent::Line(line));
            inner.endpoint = Some(url.clone());
            self.emit(SessionEvent::Ready { endpoint: url });
        }
    }

    /// Take the dev server handle out of the session and kill it.
    async fn stop_dev_server(&self) {
        let dev = self.inner.lock().dev.take();
        if let Some(dev) = dev {
            tracing::debug!("Killing dev server #{}", dev.generation);
            dev.handle.kill().await;
        }
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    fn push(&self, line: TerminalLine) {
        self.inner.lock().log.push(line.clone());
        self.emit(SessionEvent::Line(line));
    }

    fn set_state(&self, next: LifecycleState) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, next);
    }

    fn fail(&self, err: SessionError) -> SessionError {
        let mut inner = self.inner.lock();
        self.fail_locked(&mut inner, err)
    }

    fn fail_locked(&self, inner: &mut Inner, err: SessionError) -> SessionError {
        if inner.state == LifecycleState::Error {
            return err;
        }
        if self.transition(inner, LifecycleState::Error) {
            let message = err.to_string();
            tracing::warn!("Session failed: {message}");
            inner.error = Some(message.clone());
            inner.exit_code = err.exit_code();
            let line = TerminalLine::error(message.clone());
            inner.log.push(line.clone());
            self.emit(SessionEvent::Line(line));
            self.emit(SessionEvent::Failed { message });
        }
        err
    }

    /// Apply `next` if it is a legal edge from the current state.
    fn transition(&self, inner: &mut Inner, next: LifecycleState) -> bool {
        let from = inner.state;
        if !from.can_transition_to(next) {
            tracing::warn!("Refusing illegal transition {from} → {next}");
            return false;
        }
        if from == LifecycleState::Ready {
            inner.endpoint = None;
        }
        if from == LifecycleState::Error {
            inner.error = None;
            inner.exit_code = None;
        }
        inner.state = next;
        tracing::info!("Session {from} → {next}");
        self.emit(SessionEvent::StateChanged { from, to: next });
        true
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn is_current(inner: &Inner, generation: u64) -> bool {
    inner
        .dev
        .as_ref()
        .is_some_and(|dev| dev.generation == generation)
}
