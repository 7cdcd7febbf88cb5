//! TOML-based configuration system for SnipSync.
//!
//! Secrets are stored as `_env` fields that name environment variables; the
//! values are resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::RepoFormat;
use crate::conflict::{merger_for, ConflictResolver, ContainmentPolicy, MergeStrategy, Reconciler};
use crate::errors::ConfigError;
use crate::git::GitSettings;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Repository the collection is synchronized through.
    pub repository: RepositoryConfig,

    /// Merge and cycle behaviour.
    #[serde(default)]
    pub sync: SyncConfig,
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory for persistent data (database, default working tree).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.local/share/snipsync")
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Working tree location. Defaults to `<data_dir>/repo`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Remote URL (HTTPS, SSH or a local path).
    pub remote_url: String,

    #[serde(default = "default_remote_name")]
    pub remote_name: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Environment variable holding an HTTPS access token.
    #[serde(default)]
    pub token_env: Option<String>,

    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Working-tree layout.
    #[serde(default)]
    pub format: RepoFormat,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_remote_name() -> String {
    "origin".into()
}
fn default_branch() -> String {
    "main".into()
}
fn default_author_name() -> String {
    "snipsync".into()
}
fn default_author_email() -> String {
    "snipsync@localhost".into()
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub merge_strategy: MergeStrategy,

    /// How to read "one side contains the other".
    #[serde(default)]
    pub containment_policy: ContainmentPolicy,

    /// Cap on added+removed lines for a synthesized merge.
    #[serde(default = "default_max_auto_merge_lines")]
    pub max_auto_merge_lines: usize,

    /// Keep the local version of conflicting directories instead of remote.
    #[serde(default)]
    pub protect_local_directories: bool,

    /// Age after which a leftover merge or pending conflict may be cleaned up.
    #[serde(default = "default_stale_merge_grace")]
    pub stale_merge_grace_secs: u64,

    /// Age after which a held sync lock is considered abandoned.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Fetch+merge+push retries after a rejected push.
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,
}

fn default_max_auto_merge_lines() -> usize {
    crate::conflict::merger::DEFAULT_MAX_CHANGED_LINES
}
fn default_stale_merge_grace() -> u64 {
    300
}
fn default_lock_timeout() -> u64 {
    900
}
fn default_push_retries() -> u32 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::default(),
            containment_policy: ContainmentPolicy::default(),
            max_auto_merge_lines: default_max_auto_merge_lines(),
            protect_local_directories: false,
            stale_merge_grace_secs: default_stale_merge_grace(),
            lock_timeout_secs: default_lock_timeout(),
            push_retries: default_push_retries(),
        }
    }
}

impl SyncConfig {
    /// Build the reconciler this configuration describes.
    pub fn reconciler(&self) -> Reconciler {
        let merger = merger_for(
            self.merge_strategy,
            self.containment_policy,
            self.max_auto_merge_lines,
        );
        Reconciler::new(ConflictResolver::new(merger, self.protect_local_directories))
    }

    pub fn stale_merge_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_merge_grace_secs).unwrap_or(i64::MAX))
    }

    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lock_timeout_secs).unwrap_or(i64::MAX))
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

/// Commented configuration written by `snipsync init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# SnipSync configuration

[general]
# Database and default working tree location.
data_dir = "~/.local/share/snipsync"
log_level = "info"

[repository]
# path = "~/.local/share/snipsync/repo"
remote_url = "https://github.com/you/snippets.git"
remote_name = "origin"
branch = "main"
# Environment variable holding an HTTPS token.
# token_env = "SNIPSYNC_TOKEN"
author_name = "snipsync"
author_email = "snipsync@localhost"
# markdown | json
format = "markdown"

[sync]
# heuristic | three_way | three_way_then_heuristic
merge_strategy = "heuristic"
# timestamp_intent | prefer_superset | manual
containment_policy = "timestamp_intent"
max_auto_merge_lines = 10
protect_local_directories = false
stale_merge_grace_secs = 300
lock_timeout_secs = 900
push_retries = 1
"#;

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from the environment and expand `~/` in paths.
    ///
    /// A missing token is logged, not fatal: public and local remotes work
    /// without one.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.repository.token_env {
            self.repository.token = resolve_optional_env(env_name, "repository.token_env");
        }

        self.general.data_dir = expand_home(&self.general.data_dir);
        if let Some(path) = self.repository.path.take() {
            self.repository.path = Some(expand_home(&path));
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.remote_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.remote_url".into(),
                detail: "remote URL must not be empty".into(),
            });
        }
        if self.repository.remote_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.remote_name".into(),
                detail: "remote name must not be empty".into(),
            });
        }
        if self.repository.branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        if self.sync.max_auto_merge_lines == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_auto_merge_lines".into(),
                detail: "must be > 0".into(),
            });
        }
        if self.sync.push_retries > 3 {
            return Err(ConfigError::InvalidValue {
                field: "sync.push_retries".into(),
                detail: "at most 3 retries are allowed".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Working tree location.
    pub fn repo_path(&self) -> PathBuf {
        self.repository
            .path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join("repo"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.general.data_dir.join("snipsync.db")
    }

    pub fn git_settings(&self) -> GitSettings {
        GitSettings {
            remote_name: self.repository.remote_name.clone(),
            branch: self.repository.branch.clone(),
            token: self.repository.token.clone(),
            author_name: self.repository.author_name.clone(),
            author_email: self.repository.author_email.clone(),
        }
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => {
            warn!(path = %path.display(), "HOME not set, leaving path unexpanded");
            path.to_path_buf()
        }
    }
}
