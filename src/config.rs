use crate::git::credentials::mask_credentials;
use crate::git::SyncConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "upstream-sync.toml";

/// Main configuration structure for the updater
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Upstream repository settings
    pub upstream: UpstreamConfig,
    /// Dependency reinstallation settings
    pub install: InstallConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Repository the deployment tracks. Empty disables updates.
    pub repo_url: String,
    /// Branch checked out from the upstream repository
    pub branch: String,
    /// Access token embedded in HTTPS remote URLs (can be set via GIT_TOKEN)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Command line run after a successful sync
    pub command: String,
    /// Kill the install command after this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or `EnvFilter` directives
    pub log_level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            branch: "main".to_string(),
            git_token: None,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: "pip3 install --no-cache-dir -r requirements.txt".to_string(),
            timeout_secs: None, // no limit, matching a plain blocking install
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl InstallConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl UpdaterConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `upstream-sync.toml` in `dir`
    /// 3. Environment variables (prefixed with UPSTREAM_SYNC_, `__` between keys)
    /// 4. The bot's UPSTREAM_REPO, UPSTREAM_BRANCH and GIT_TOKEN variables
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&Self::default()).context("Failed to build default configuration")?,
        );

        let file = dir.join(CONFIG_FILE_NAME);
        if file.exists() {
            builder = builder.add_source(File::from(file));
        }

        builder = builder.add_source(
            Environment::with_prefix("UPSTREAM_SYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut updater_config: UpdaterConfig = builder
            .build()?
            .try_deserialize()
            .context("Invalid configuration")?;

        updater_config.apply_legacy_env(|key| std::env::var(key).ok());
        Ok(updater_config)
    }

    /// Overlay the variable names the bot's own config module reads.
    pub fn apply_legacy_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(repo_url) = lookup("UPSTREAM_REPO").filter(|v| !v.is_empty()) {
            self.upstream.repo_url = repo_url;
        }
        if let Some(branch) = lookup("UPSTREAM_BRANCH").filter(|v| !v.is_empty()) {
            self.upstream.branch = branch;
        }
        if let Some(token) = lookup("GIT_TOKEN") {
            self.upstream.git_token = Some(token);
        }
    }

    /// Settings for one sync attempt. An empty token counts as no token.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            repo_url: self.upstream.repo_url.clone(),
            branch: self.upstream.branch.clone(),
            git_token: self
                .upstream
                .git_token
                .clone()
                .filter(|token| !token.is_empty()),
            install_command: self.install.command.clone(),
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// TOML rendering with the access token masked
    pub fn to_masked_toml(&self) -> Result<String> {
        let mut masked = self.clone();
        if masked.upstream.git_token.is_some() {
            masked.upstream.git_token = Some("***".to_string());
        }
        masked.upstream.repo_url = mask_credentials(&masked.upstream.repo_url);
        Ok(toml::to_string_pretty(&masked)?)
    }

    /// Load `.env` from `dir` if it exists
    pub fn load_env_file(dir: &Path) -> Result<()> {
        let env_file = dir.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
            tracing::debug!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
