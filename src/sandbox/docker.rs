//! Docker sandbox provider: runs a local container as a sandbox.
//!
//! Uses [`bollard`] to manage the container. Only a running Docker daemon is
//! needed. The container idles on `sleep infinity`; files are written and
//! commands run through `docker exec`. The dev server port is mapped to a
//! random host port, so preview URLs are `http://localhost:{host_port}`.

use super::{
    detect_server_url, ProcessHandle, Sandbox, SandboxProvider, ServerReady, SpawnedProcess,
    EXIT_UNKNOWN, OUTPUT_BUFFER,
};
use crate::output::{LineSplitter, Utf8Decoder};
use crate::project::vfs::VirtualFilesystemTree;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Project root inside the container.
pub const PROJECT_DIR: &str = "/home/project";

/// Boots one container per [`SandboxProvider::boot`].
pub struct DockerProvider {
    docker: Docker,
    image: String,
    port: u16,
}

impl DockerProvider {
    /// Connect using the default Docker socket path.
    pub fn new(image: &str, port: u16) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker: {e}"))?;
        Ok(Self {
            docker,
            image: image.to_string(),
            port,
        })
    }

    async fn pull_image(&self) {
        let mut pull_stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = pull_stream.next().await {
            // Layers already present surface as stream errors.
            if let Err(e) = item {
                tracing::debug!("Docker pull stream item: {e}");
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Sandbox>> {
        self.pull_image().await;

        let port_key = format!("{}/tcp", self.port);
        let port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> = [(
            port_key.clone(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("0".to_string()),
            }]),
        )]
        .into_iter()
        .collect();

        let host_config = bollard::models::HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                None::<CreateContainerOptions<&str>>,
                ContainerConfig {
                    image: Some(self.image.as_str()),
                    cmd: Some(vec!["sleep", "infinity"]),
                    working_dir: Some(PROJECT_DIR),
                    exposed_ports: Some({
                        let mut m = HashMap::new();
                        m.insert(port_key.as_str(), HashMap::new());
                        m
                    }),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Docker container: {e}"))?;

        let container_id = container.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<&str>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start Docker container: {e}"))?;

        let inspect = self
            .docker
            .inspect_container(&container_id, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container: {e}"))?;

        let host_port = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
            .and_then(|ports| ports.get(&port_key))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|b| b.host_port.as_ref())
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("Could not determine mapped host port for container"))?;

        tracing::debug!("Container {container_id} maps {port_key} to host port {host_port}");

        let (ready_tx, _) = broadcast::channel(16);
        let sandbox: Arc<dyn Sandbox> = Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            container_id,
            host_port,
            ready_tx,
            next_pid_file: AtomicU64::new(0),
        });
        Ok(sandbox)
    }

    fn name(&self) -> &str {
        "docker"
    }
}

pub struct DockerSandbox {
    docker: Docker,
    container_id: String,
    host_port: u16,
    ready_tx: broadcast::Sender<ServerReady>,
    next_pid_file: AtomicU64,
}

impl DockerSandbox {
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Run `sh -c command` to completion, returning `(stdout, stderr, exit)`.
    async fn run(&self, command: &str) -> anyhow::Result<(String, String, i64)> {
        let exec_id = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    working_dir: Some("/"),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create exec: {e}"))?
            .id;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start exec: {e}"))?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(|e| anyhow::anyhow!("Exec output error: {e}"))? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect exec: {e}"))?;

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            inspect.exit_code.unwrap_or(0),
        ))
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let target = format!("{PROJECT_DIR}/{path}");
        let dir = std::path::Path::new(&target)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or(PROJECT_DIR)
            .to_string();

        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, content);
        let cmd = format!(
            "mkdir -p {} && printf '%s' '{b64}' | base64 -d > {}",
            shell_quote(&dir),
            shell_quote(&target)
        );

        let (_, stderr, exit_code) = self.run(&cmd).await?;
        if exit_code != 0 {
            anyhow::bail!("Writing {path} failed (exit {exit_code}): {}", stderr.trim());
        }
        Ok(())
    }
}

struct DockerHandle {
    docker: Docker,
    container_id: String,
    pid_file: String,
    killed: AtomicBool,
}

/// Kill the recorded process and everything below it. The pid list is
/// collected before any signal is sent.
fn kill_script(pid_file: &str) -> String {
    format!(
        "tree() {{ for c in $(pgrep -P \"$1\"); do tree \"$c\"; done; echo \"$1\"; }}; \
         [ -f {0} ] && kill -9 $(tree \"$(cat {0})\") 2>/dev/null; rm -f {0}",
        pid_file
    )
}

#[async_trait]
impl ProcessHandle for DockerHandle {
    async fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let script = kill_script(&self.pid_file);
        let created = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", script.as_str()]),
                    ..Default::default()
                },
            )
            .await;
        match created {
            Ok(exec) => {
                let detached = Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                });
                if let Err(e) = self.docker.start_exec(&exec.id, detached).await {
                    tracing::warn!("Failed to kill process in {}: {e}", self.container_id);
                }
            }
            Err(e) => tracing::warn!("Failed to kill process in {}: {e}", self.container_id),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn mount(&self, tree: &VirtualFilesystemTree) -> anyhow::Result<()> {
        for dir in tree.directories() {
            let (_, stderr, exit_code) = self
                .run(&format!("mkdir -p {}", shell_quote(&format!("{PROJECT_DIR}/{dir}"))))
                .await?;
            anyhow::ensure!(exit_code == 0, "Creating {dir} failed: {}", stderr.trim());
        }
        for (path, contents) in tree.files() {
            self.write_file(&path, contents).await?;
        }
        tracing::debug!(
            "Mounted {} files into container {}",
            tree.file_count(),
            self.container_id
        );
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let n = self.next_pid_file.fetch_add(1, Ordering::SeqCst);
        let pid_file = format!("/tmp/sandpreview-{n}.pid");
        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        let script = format!("echo $$ > {pid_file}; exec {command_line}");

        let exec_id = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", script.as_str()]),
                    working_dir: Some(PROJECT_DIR),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create exec: {e}"))?
            .id;

        let started = self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start exec: {e}"))?;
        let StartExecResults::Attached { mut output, .. } = started else {
            anyhow::bail!("Exec for {command} started detached");
        };

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();

        let docker = self.docker.clone();
        let ready_tx = self.ready_tx.clone();
        let host_port = self.host_port;
        tokio::spawn(async move {
            let mut splitter = LineSplitter::new();
            let mut stdout = Utf8Decoder::new();
            let mut stderr = Utf8Decoder::new();
            let mut announced = false;
            while let Some(chunk) = output.next().await {
                let text = match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("Exec output error: {e}");
                        break;
                    }
                };
                if text.is_empty() {
                    continue;
                }
                if !announced {
                    let lines = splitter.push(&text);
                    if lines.iter().any(|line| detect_server_url(line).is_some()) {
                        announced = true;
                        let _ = ready_tx.send(ServerReady {
                            port: host_port,
                            url: format!("http://localhost:{host_port}"),
                        });
                    }
                }
                let _ = out_tx.send(text).await;
            }
            for rest in [stdout.finish(), stderr.finish()] {
                if !rest.is_empty() {
                    let _ = out_tx.send(rest).await;
                }
            }
            drop(out_tx);

            let code = match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => inspect
                    .exit_code
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(EXIT_UNKNOWN),
                Err(e) => {
                    tracing::warn!("Failed to inspect exec {exec_id}: {e}");
                    EXIT_UNKNOWN
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            output: out_rx,
            exit: exit_rx,
            handle: Arc::new(DockerHandle {
                docker: self.docker.clone(),
                container_id: self.container_id.clone(),
                pid_file,
                killed: AtomicBool::new(false),
            }),
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    fn id(&self) -> String {
        let short: String = self.container_id.chars().take(12).collect();
        format!("docker:{short}")
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to remove Docker container: {e}"))?;
        tracing::info!("Container {} removed", self.container_id);
        Ok(())
    }
}

/// Single-quote `s` for `sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
