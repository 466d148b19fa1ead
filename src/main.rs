use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandpreview::config::PreviewConfig;
use sandpreview::preview;
use sandpreview::project::{sniff, synth, ProjectFileTree};
use sandpreview::reload::{HotReloadCoordinator, ReloadOutcome};
use sandpreview::sandbox::{self, SandboxContext};
use sandpreview::session::{LifecycleState, SandboxSession, SessionError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sandpreview")]
#[command(version, about = "Live preview orchestrator for in-memory web projects")]
struct Cli {
    /// Config file (defaults to <config dir>/sandpreview/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the synthesized manifest and the files that would be mounted
    Synth { dir: PathBuf },
    /// Print the packages imported by a project's source files
    Sniff { dir: PathBuf },
    /// Boot, install and serve a project
    Run {
        dir: PathBuf,
        /// Poll the directory and hot-reload changes
        #[arg(long)]
        watch: bool,
    },
    /// Dump the loaded project tree as JSON
    Tree { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = PreviewConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Synth { dir } => cmd_synth(&config, &dir),
        Commands::Sniff { dir } => cmd_sniff(&dir),
        Commands::Tree { dir } => cmd_tree(&dir),
        Commands::Run { dir, watch } => cmd_run(&config, &dir, watch).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sandpreview=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandpreview=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(dir: &Path) -> Result<ProjectFileTree> {
    ProjectFileTree::load_dir(dir).with_context(|| format!("Failed to load {}", dir.display()))
}

fn cmd_synth(config: &PreviewConfig, dir: &Path) -> Result<()> {
    let tree = load(dir)?;
    let options = config.session_options();
    let synthesis = synth::synthesize(&tree, &options.synth)?;

    println!("{}", synthesis.manifest.to_json());
    println!();
    for (path, contents) in synthesis.vfs.files() {
        println!("{path} ({} bytes)", contents.len());
    }
    match (&synthesis.entry, synthesis.generated_entry) {
        (Some(entry), true) => println!("\nentry: {entry} (generated)"),
        (Some(entry), false) => println!("\nentry: {entry}"),
        (None, _) => println!("\nentry: none found"),
    }
    Ok(())
}

fn cmd_sniff(dir: &Path) -> Result<()> {
    let tree = load(dir)?;
    let files = tree.files();
    let packages = sniff::sniff(files.iter().map(|(path, node)| (path.as_str(), node.text())));
    for package in packages {
        println!("{package}");
    }
    Ok(())
}

fn cmd_tree(dir: &Path) -> Result<()> {
    let tree = load(dir)?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

/// What the run loop does next.
enum Step {
    Reload,
    Restart,
}

async fn cmd_run(config: &PreviewConfig, dir: &Path, watch: bool) -> Result<()> {
    let tree = load(dir)?;
    let provider = sandbox::create_provider(config)?;
    let context = Arc::new(SandboxContext::new(provider));
    let session = SandboxSession::new(context, config.session_options());
    let coordinator = HotReloadCoordinator::new(Arc::clone(&session));

    let printer = tokio::spawn(print_events(session.subscribe()));
    // One listener for the whole run; every lifecycle await races it.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        result = coordinator.on_change(&tree) => report(result),
        _ = &mut ctrl_c => {
            tracing::info!("Interrupted during boot");
            session.shutdown().await;
            printer.abort();
            return Ok(());
        }
    }
    if !watch && session.state() != LifecycleState::Ready {
        session.shutdown().await;
        printer.abort();
        anyhow::bail!(
            "{}",
            session
                .error()
                .unwrap_or_else(|| "Preview did not start".to_string())
        );
    }

    if watch {
        println!(
            "{}",
            console::style("Watching for changes. Type `r` + Enter to restart, Ctrl-C to stop.")
                .dim()
        );
    }

    let mut latest = tree;
    let mut poll = tokio::time::interval(Duration::from_millis(config.reload.poll_interval_ms));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        let step = tokio::select! {
            _ = &mut ctrl_c => break,
            _ = poll.tick(), if watch => Step::Reload,
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim() == "r" => Step::Restart,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    stdin_open = false;
                    continue;
                }
            },
        };

        let work = async {
            match step {
                Step::Reload => reload(&coordinator, dir, &mut latest).await,
                Step::Restart => {
                    let result = coordinator.restart(&latest).await.map(ReloadOutcome::Restarted);
                    report(result);
                }
            }
        };
        tokio::select! {
            () = work => {}
            _ = &mut ctrl_c => break,
        }
    }

    tracing::info!("Stopping");
    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn reload(coordinator: &HotReloadCoordinator, dir: &Path, latest: &mut ProjectFileTree) {
    match ProjectFileTree::load_dir(dir) {
        Ok(tree) => *latest = tree,
        Err(e) => {
            tracing::warn!("Failed to reload {}: {e}", dir.display());
            return;
        }
    }
    if let Some(result) = coordinator.apply_pending().await {
        report(result);
    }
    report(coordinator.on_change(latest).await);
}

async fn print_events(mut events: broadcast::Receiver<preview::SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(text) = preview::render_event(&event) {
                    println!("{text}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Terminal fell behind, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report(result: Result<ReloadOutcome, SessionError>) {
    match result {
        Ok(ReloadOutcome::Unchanged) => {}
        Ok(ReloadOutcome::Deferred) => tracing::debug!("Change deferred until the session settles"),
        Ok(outcome) => tracing::debug!("Reload outcome: {outcome:?}"),
        // Already rendered through the event stream.
        Err(e) => tracing::debug!("Lifecycle failed: {e}"),
    }
}
