//! Configuration system for the `chatsync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::message::UserId;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Could not determine the user's config directory.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoConfigDir,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    user_id: Option<String>,
    channels: ChannelsFileConfig,
    api: ApiFileConfig,
    reconnect: ReconnectFileConfig,
    engine: EngineFileConfig,
}

/// `[channels]` section: one socket URL per channel.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChannelsFileConfig {
    admin: Option<String>,
    shop: Option<String>,
    ai: Option<String>,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    token: Option<String>,
    page_size: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[engine]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EngineFileConfig {
    typing_ttl_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Exponential backoff policy for channel reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before the 1-based `attempt`.
    ///
    /// Doubles from `initial_delay` and saturates at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

/// Settings consumed by the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The signed-in user; their own echoes never count as unread.
    pub local_user: UserId,
    /// How long a typing indicator lives without a refresh.
    pub typing_ttl: Duration,
    /// Messages per history page.
    pub page_size: usize,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectConfig,
}

impl EngineConfig {
    /// Engine settings with defaults for `local_user`.
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        let defaults = ClientConfig::default();
        Self {
            local_user,
            typing_ttl: defaults.typing_ttl,
            page_size: defaults.page_size,
            channel_capacity: defaults.channel_capacity,
            reconnect: defaults.reconnect,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The signed-in user id.
    pub user_id: Option<String>,

    // -- Channels --
    /// Socket URL of the admin channel.
    pub admin_url: Option<String>,
    /// Socket URL of the shop channel.
    pub shop_url: Option<String>,
    /// Socket URL of the AI channel.
    pub ai_url: Option<String>,

    // -- API --
    /// Base URL of the REST API.
    pub api_base_url: Option<String>,
    /// Bearer token for the REST API.
    pub api_token: Option<String>,
    /// Messages per history page.
    pub page_size: usize,

    // -- Engine --
    /// Reconnect backoff policy.
    pub reconnect: ReconnectConfig,
    /// Typing indicator lifetime.
    pub typing_ttl: Duration,
    /// Timeout for a single socket dial.
    pub connect_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            admin_url: None,
            shop_url: None,
            ai_url: None,
            api_base_url: None,
            api_token: None,
            page_size: 50,
            reconnect: ReconnectConfig::default(),
            typing_ttl: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path
    /// (`~/.config/chatsync/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectConfig {
            initial_delay: file
                .reconnect
                .initial_delay_ms
                .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
            max_delay: file
                .reconnect
                .max_delay_ms
                .map_or(defaults.reconnect.max_delay, Duration::from_millis),
            max_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
        };

        Self {
            user_id: cli.user_id.clone().or_else(|| file.user_id.clone()),
            admin_url: cli
                .admin_url
                .clone()
                .or_else(|| file.channels.admin.clone()),
            shop_url: cli.shop_url.clone().or_else(|| file.channels.shop.clone()),
            ai_url: cli.ai_url.clone().or_else(|| file.channels.ai.clone()),
            api_base_url: cli
                .api_url
                .clone()
                .or_else(|| file.api.base_url.clone()),
            api_token: cli.api_token.clone().or_else(|| file.api.token.clone()),
            page_size: file.api.page_size.unwrap_or(defaults.page_size),
            reconnect,
            typing_ttl: file
                .engine
                .typing_ttl_ms
                .map_or(defaults.typing_ttl, Duration::from_millis),
            connect_timeout: file
                .engine
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .engine
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        }
    }

    /// Configured socket URLs keyed by channel.
    #[must_use]
    pub fn channel_urls(&self) -> HashMap<ChannelKey, String> {
        [
            (ChannelKey::Admin, &self.admin_url),
            (ChannelKey::Shop, &self.shop_url),
            (ChannelKey::Ai, &self.ai_url),
        ]
        .into_iter()
        .filter_map(|(key, url)| url.clone().map(|u| (key, u)))
        .collect()
    }

    /// Build an [`EngineConfig`], if the local user is known.
    #[must_use]
    pub fn to_engine_config(&self) -> Option<EngineConfig> {
        let user = self.user_id.as_deref().filter(|u| !u.is_empty())?;
        Some(EngineConfig {
            local_user: UserId::new(user),
            typing_ttl: self.typing_ttl,
            page_size: self.page_size,
            channel_capacity: self.channel_capacity,
            reconnect: self.reconnect.clone(),
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless real-time chat synchronization client")]
pub struct CliArgs {
    /// Your user id as known to the chat server.
    #[arg(long, env = "CHATSYNC_USER")]
    pub user_id: Option<String>,

    /// WebSocket URL of the admin channel.
    #[arg(long, env = "CHATSYNC_ADMIN_URL")]
    pub admin_url: Option<String>,

    /// WebSocket URL of the shop channel.
    #[arg(long, env = "CHATSYNC_SHOP_URL")]
    pub shop_url: Option<String>,

    /// WebSocket URL of the AI channel.
    #[arg(long, env = "CHATSYNC_AI_URL")]
    pub ai_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "CHATSYNC_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for the REST API.
    #[arg(long, env = "CHATSYNC_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Conversation to open after startup.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Default location of the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoConfigDir`] if no config directory exists.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("chatsync").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Ok(path) = default_config_path() else {
        return Ok(ConfigFile::default());
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
