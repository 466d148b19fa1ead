//! Configuration for sandpreview.
//!
//! Read from `<config dir>/sandpreview/config.toml` unless a path is given
//! explicitly. A missing file yields the defaults below.
//!
//! ```toml
//! [project]
//! name = "sandbox-project"
//!
//! [sandbox]
//! provider = "local"            # or "docker"
//! workdir = "~/.cache/sandpreview/project"
//! image = "node:20-alpine"
//! port = 3000
//!
//! [commands]
//! install = ["npm", "install"]
//! dev = ["npm", "run", "dev"]
//!
//! [reload]
//! poll_interval_ms = 500
//! ```

use crate::project::synth::SynthOptions;
use crate::session::{CommandSpec, SessionOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which sandbox provider backs the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Host processes in a work directory
    #[default]
    Local,
    /// Local Docker container
    Docker,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "docker" => Ok(ProviderKind::Docker),
            _ => anyhow::bail!("Invalid sandbox provider '{s}'. Valid values: local, docker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    /// Package name when the project has no usable package.json
    #[serde(default = "default_project_name")]
    pub name: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: default_project_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSection {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Host directory the local provider materializes the project into.
    /// `~` is expanded. Defaults to a cache directory.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Container image for the docker provider.
    #[serde(default = "default_image")]
    pub image: String,
    /// Port the dev server binds inside the sandbox.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            workdir: None,
            image: default_image(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandsSection {
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    #[serde(default = "default_dev")]
    pub dev: Vec<String>,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            install: default_install(),
            dev: default_dev(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadSection {
    /// How often `run --watch` rereads the project directory.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ReloadSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreviewConfig {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub reload: ReloadSection,
}

fn default_project_name() -> String {
    "sandbox-project".to_string()
}

fn default_image() -> String {
    "node:20-alpine".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_install() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_dev() -> Vec<String> {
    vec!["npm".to_string(), "run".to_string(), "dev".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl PreviewConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "sandpreview")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from [`PreviewConfig::default_path`] when `None`.
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            anyhow::ensure!(!explicit, "Config file not found: {}", path.display());
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.commands.install.is_empty(), "commands.install must not be empty");
        anyhow::ensure!(!self.commands.dev.is_empty(), "commands.dev must not be empty");
        anyhow::ensure!(self.sandbox.port != 0, "sandbox.port must be non-zero");
        anyhow::ensure!(
            self.reload.poll_interval_ms >= 50,
            "reload.poll_interval_ms must be at least 50"
        );
        Ok(())
    }

    /// Work directory for the local provider, with `~` expanded.
    pub fn workdir(&self) -> PathBuf {
        match &self.sandbox.workdir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => directories::ProjectDirs::from("", "", "sandpreview")
                .map(|dirs| dirs.cache_dir().join("project"))
                .unwrap_or_else(|| std::env::temp_dir().join("sandpreview-project")),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            install: CommandSpec::from_argv(&self.commands.install),
            dev: CommandSpec::from_argv(&self.commands.dev),
            synth: SynthOptions {
                project_name: self.project.name.clone(),
                dev_port: self.sandbox.port,
            },
        }
    }
}
