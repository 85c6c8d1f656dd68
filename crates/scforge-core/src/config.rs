//! Configuration management for scforge
//!
//! Repository-level settings for the build loop, the compiler toolchain,
//! the generation collaborator, workspaces and the session store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ForgeError, Result};

/// Directory holding scforge state inside a repository
pub const FORGE_DIR: &str = ".scforge";

/// Repository-level scforge configuration
///
/// Loaded from `.scforge/config.toml` in the repo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Build loop defaults
    #[serde(default)]
    pub loop_defaults: LoopDefaults,

    /// Compiler toolchain invocation
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Generation collaborator settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Per-session workspace settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Session audit store
    #[serde(default)]
    pub store: StoreConfig,
}

/// Default build loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDefaults {
    /// Attempts allowed per session when a request does not say
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// How to invoke the external compiler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Executable to run inside the workspace
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments passed to the executable
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Per-attempt build timeout
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// anchor-lang version written into scaffolded workspaces
    #[serde(default = "default_anchor_version")]
    pub anchor_version: String,
}

/// Generation collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Model alias (opus, sonnet, haiku)
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Call-level timeout, distinct from the build timeout
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

/// Workspace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for per-session workspaces
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,

    /// Anchor project copied into each new workspace
    #[serde(default)]
    pub template_dir: Option<PathBuf>,

    /// Keep workspaces after the session ends
    #[serde(default)]
    pub retain: bool,
}

/// Session store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

// Default value providers
fn default_max_attempts() -> u32 {
    3
}

fn default_program() -> String {
    "anchor".to_string()
}

fn default_args() -> Vec<String> {
    vec!["build".to_string()]
}

fn default_build_timeout_secs() -> u64 {
    300
}

fn default_anchor_version() -> String {
    "0.30.1".to_string()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_max_tokens() -> usize {
    4000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_generation_timeout_secs() -> u64 {
    180
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(FORGE_DIR).join("workspaces")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(FORGE_DIR).join("sessions")
}

impl ForgeConfig {
    /// Load configuration from `.scforge/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(FORGE_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| ForgeError::Config(format!("Failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.scforge/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(FORGE_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ForgeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Resolve relative workspace and store paths against the repo root
    pub fn resolve_paths(mut self, repo_root: &Path) -> Self {
        if self.workspace.root.is_relative() {
            self.workspace.root = repo_root.join(&self.workspace.root);
        }
        if let Some(template) = &self.workspace.template_dir {
            if template.is_relative() {
                self.workspace.template_dir = Some(repo_root.join(template));
            }
        }
        if self.store.dir.is_relative() {
            self.store.dir = repo_root.join(&self.store.dir);
        }
        self
    }
}

impl ToolchainConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            loop_defaults: LoopDefaults::default(),
            toolchain: ToolchainConfig::default(),
            generation: GenerationConfig::default(),
            workspace: WorkspaceConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for LoopDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            build_timeout_secs: default_build_timeout_secs(),
            anchor_version: default_anchor_version(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            template_dir: None,
            retain: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}
