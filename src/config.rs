//! Configuration for issue-enhancer.
//!
//! Settings come from an optional `enhancer.toml` in the data directory (or an
//! explicit `--config` path); secrets come from the environment. Everything is
//! resolved once at startup into an [`EnhancerConfig`] that is passed by
//! reference into the components. No component reads the environment itself.
//!
//! # Configuration File Format
//!
//! ```toml
//! [sync]
//! interval_minutes = 60
//! order = ["slack", "gdrive", "github", "gmail"]
//! sync_on_boot = true
//!
//! [cache]
//! ttl_secs = 3600
//! sweep_secs = 300
//!
//! [pipeline]
//! default_model = "opus"
//! context_timeout_secs = 120
//! code_timeout_secs = 600
//! synthesis_timeout_secs = 600
//!
//! [email]
//! allowed_senders = ["partner@vendor.com", "@customer.io"]
//! internal_domains = ["acme.io"]
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::connectors::{CHAT, DOCUMENTS, EMAIL, GITHUB};

pub const CONFIG_FILE_NAME: &str = "enhancer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Corpus age after which a sync is due (scheduled and lazy resync).
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Connector execution order. Chat runs before email so chat-derived
    /// addresses are in the corpus when the allow-list is rebuilt.
    #[serde(default = "default_order")]
    pub order: Vec<String>,
    #[serde(default = "default_true")]
    pub sync_on_boot: bool,
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_order() -> Vec<String> {
    [CHAT, DOCUMENTS, GITHUB, EMAIL]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            order: default_order(),
            sync_on_boot: true,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_sweep_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_secs: default_sweep_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model shorthand or full model id used when no override is given.
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    #[serde(default = "default_context_timeout")]
    pub context_timeout_secs: u64,
    #[serde(default = "default_code_timeout")]
    pub code_timeout_secs: u64,
    #[serde(default = "default_synthesis_timeout")]
    pub synthesis_timeout_secs: u64,
    #[serde(default = "default_max_records")]
    pub max_context_records: usize,
    #[serde(default = "default_max_excerpts")]
    pub max_code_excerpts: usize,
    /// Descriptions longer than this are considered hand-written.
    #[serde(default = "default_minimal_chars")]
    pub minimal_description_chars: usize,
    /// How long a handled `IssueCreated` is remembered for redelivery dedupe.
    #[serde(default = "default_dedupe_minutes")]
    pub create_dedupe_minutes: u64,
}

fn default_model() -> String {
    "opus".to_string()
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_context_timeout() -> u64 {
    120
}

fn default_code_timeout() -> u64 {
    600
}

fn default_synthesis_timeout() -> u64 {
    600
}

fn default_max_records() -> usize {
    8
}

fn default_max_excerpts() -> usize {
    12
}

fn default_minimal_chars() -> usize {
    200
}

fn default_dedupe_minutes() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            claude_cmd: default_claude_cmd(),
            context_timeout_secs: default_context_timeout(),
            code_timeout_secs: default_code_timeout(),
            synthesis_timeout_secs: default_synthesis_timeout(),
            max_context_records: default_max_records(),
            max_code_excerpts: default_max_excerpts(),
            minimal_description_chars: default_minimal_chars(),
            create_dedupe_minutes: default_dedupe_minutes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Exact addresses, or `@domain` entries.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// Domains whose senders are always allowed and tagged internal.
    #[serde(default)]
    pub internal_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Secrets and credential-derived settings, read from the environment once.
#[derive(Clone, Default)]
pub struct Credentials {
    pub slack_token: Option<String>,
    pub google_access_token: Option<String>,
    pub gmail_enabled: bool,
    pub github_token: Option<String>,
    pub github_org: Option<String>,
    pub linear_api_key: Option<String>,
    pub linear_webhook_secret: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(v: &Option<String>) -> &'static str {
            if v.is_some() { "<set>" } else { "<unset>" }
        }
        f.debug_struct("Credentials")
            .field("slack_token", &mask(&self.slack_token))
            .field("google_access_token", &mask(&self.google_access_token))
            .field("gmail_enabled", &self.gmail_enabled)
            .field("github_token", &mask(&self.github_token))
            .field("github_org", &self.github_org)
            .field("linear_api_key", &mask(&self.linear_api_key))
            .field("linear_webhook_secret", &mask(&self.linear_webhook_secret))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            slack_token: get("SLACK_TOKEN"),
            google_access_token: get("GOOGLE_ACCESS_TOKEN"),
            gmail_enabled: get("GMAIL_ENABLED").is_some_and(|v| v != "0" && v != "false"),
            github_token: get("GH_TOKEN").or_else(|| get("GITHUB_TOKEN")),
            github_org: get("GITHUB_ORG"),
            linear_api_key: get("LINEAR_API_KEY"),
            linear_webhook_secret: get("LINEAR_WEBHOOK_SECRET"),
        }
    }
}

/// Which connectors participate in sync, decided by credential presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectorToggles {
    pub chat: bool,
    pub documents: bool,
    pub email: bool,
    pub github: bool,
}

impl ConnectorToggles {
    pub fn from_credentials(creds: &Credentials) -> Self {
        Self {
            chat: creds.slack_token.is_some(),
            documents: creds.google_access_token.is_some(),
            email: creds.gmail_enabled && creds.google_access_token.is_some(),
            github: creds.github_token.is_some(),
        }
    }

    pub fn is_enabled(&self, connector: &str) -> bool {
        match connector {
            CHAT => self.chat,
            DOCUMENTS => self.documents,
            EMAIL => self.email,
            GITHUB => self.github,
            _ => false,
        }
    }

    /// Credential hint shown for disabled connectors.
    pub fn requirement(connector: &str) -> &'static str {
        match connector {
            CHAT => "SLACK_TOKEN",
            DOCUMENTS => "GOOGLE_ACCESS_TOKEN",
            EMAIL => "GMAIL_ENABLED + GOOGLE_ACCESS_TOKEN",
            GITHUB => "GH_TOKEN",
            _ => "unknown connector",
        }
    }
}

/// The resolved runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(skip)]
    pub credentials: Credentials,
    #[serde(skip)]
    pub connectors: ConnectorToggles,
}

impl EnhancerConfig {
    /// Load `config_path` (or `<data_dir>/enhancer.toml` when it exists) and
    /// attach credentials.
    pub fn load(
        data_dir: &Path,
        config_path: Option<&Path>,
        credentials: Credentials,
    ) -> Result<Self> {
        let path = match config_path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = data_dir.join(CONFIG_FILE_NAME);
                default.exists().then_some(default)
            }
        };

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::parse(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.data_dir = data_dir.to_path_buf();
        config.connectors = ConnectorToggles::from_credentials(&credentials);
        config.credentials = credentials;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse TOML configuration")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("enhancer.db")
    }

    /// Ordered list of connector names that are enabled.
    pub fn enabled_connectors(&self) -> Vec<String> {
        self.sync
            .order
            .iter()
            .filter(|name| self.connectors.is_enabled(name))
            .cloned()
            .collect()
    }
}
