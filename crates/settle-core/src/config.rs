//! Configuration management for settle.
//!
//! Loads configuration from ${SETTLE_HOME}/config.toml with sensible defaults.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::client::{Credential, Endpoints};
use crate::registry::RegistryPolicy;
use crate::session::SessionOptions;
use crate::settlement::{DEFAULT_MAX_ATTEMPTS, SettlementPolicy};

/// Overrides `agent_url`.
pub const AGENT_URL_ENV: &str = "SETTLE_AGENT_URL";
/// Fallback credential source.
pub const PRIVATE_KEY_ENV: &str = "SETTLE_PRIVATE_KEY";

/// Settlement polling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval_ms: 5000,
        }
    }
}

/// Rendering preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Show tool output that carries no operation marker.
    pub show_tool_chatter: bool,
    /// Print the capability overview when the chat loop starts.
    pub greeting: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_tool_chatter: false,
            greeting: true,
        }
    }
}

/// Session registry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub idle_timeout_secs: u64,
    pub max_sessions: usize,
    pub keep_while_settling: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let policy = RegistryPolicy::default();
        Self {
            idle_timeout_secs: policy.idle_timeout.as_secs(),
            max_sessions: policy.max_sessions,
            keep_while_settling: policy.keep_while_settling,
        }
    }
}

/// Wallet credential configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub private_key: Option<String>,
}

impl fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletConfig")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the agent runtime.
    pub agent_url: String,
    pub chat_path: String,
    pub status_path: String,
    /// Whole-request timeout in seconds. 0 disables it.
    pub request_timeout_secs: u64,
    pub settlement: SettlementConfig,
    pub display: DisplayConfig,
    pub registry: RegistryConfig,
    pub wallet: WalletConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_url: Self::DEFAULT_AGENT_URL.to_string(),
            chat_path: "/api/agent".to_string(),
            status_path: "/api/transaction-status".to_string(),
            request_timeout_secs: 0,
            settlement: SettlementConfig::default(),
            display: DisplayConfig::default(),
            registry: RegistryConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

/// Returns the default config template with comments.
///
/// Embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for settle configuration and data directories.
    //!
    //! SETTLE_HOME resolution order:
    //! 1. SETTLE_HOME environment variable (if set)
    //! 2. ~/.config/settle (default)

    use std::path::PathBuf;

    /// Returns the settle home directory.
    pub fn settle_home() -> PathBuf {
        if let Ok(home) = std::env::var("SETTLE_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .unwrap_or_default()
            .join(".config")
            .join("settle")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        settle_home().join("config.toml")
    }

    /// Returns the directory for rolling log files.
    pub fn logs_dir() -> PathBuf {
        settle_home().join("logs")
    }
}

impl Config {
    pub const DEFAULT_AGENT_URL: &'static str = "http://localhost:3000";

    /// Loads configuration from the default path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the commented default config. Refuses to overwrite.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// `None` when the timeout is disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Resolves endpoint URLs. Precedence: `override_url` > env > config.
    pub fn endpoints(&self, override_url: Option<&str>) -> Result<Endpoints> {
        let env_url = std::env::var(AGENT_URL_ENV).ok();
        let agent_url = resolve_agent_url(override_url, env_url.as_deref(), &self.agent_url);
        Endpoints::new(&agent_url, &self.chat_path, &self.status_path)
    }

    /// Resolves the wallet credential.
    ///
    /// Precedence: the variable named by `key_env` > `wallet.private_key` >
    /// `SETTLE_PRIVATE_KEY`.
    pub fn credential(&self, key_env: Option<&str>) -> Result<Credential> {
        let named = match key_env {
            Some(var) => Some(
                std::env::var(var).with_context(|| format!("Environment variable {var} is not set"))?,
            ),
            None => None,
        };
        let fallback = std::env::var(PRIVATE_KEY_ENV).ok();
        resolve_credential(named.as_deref(), self.wallet.private_key.as_deref(), fallback.as_deref())
    }

    pub fn settlement_policy(&self) -> SettlementPolicy {
        SettlementPolicy {
            max_attempts: self.settlement.max_attempts.max(1),
            interval: Duration::from_millis(self.settlement.interval_ms.max(1)),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            settlement: self.settlement_policy(),
            show_tool_chatter: self.display.show_tool_chatter,
        }
    }

    pub fn registry_policy(&self) -> RegistryPolicy {
        RegistryPolicy {
            idle_timeout: Duration::from_secs(self.registry.idle_timeout_secs),
            max_sessions: self.registry.max_sessions.max(1),
            keep_while_settling: self.registry.keep_while_settling,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn resolve_agent_url(override_url: Option<&str>, env_url: Option<&str>, config_url: &str) -> String {
    non_empty(override_url)
        .or_else(|| non_empty(env_url))
        .or_else(|| non_empty(Some(config_url)))
        .unwrap_or(Config::DEFAULT_AGENT_URL)
        .to_string()
}

fn resolve_credential(
    named_env: Option<&str>,
    config_key: Option<&str>,
    default_env: Option<&str>,
) -> Result<Credential> {
    non_empty(named_env)
        .or_else(|| non_empty(config_key))
        .or_else(|| non_empty(default_env))
        .map(Credential::new)
        .with_context(|| {
            format!(
                "No wallet key available. Set {PRIVATE_KEY_ENV}, pass --key-env <VAR>, or set private_key in [wallet]."
            )
        })
}
