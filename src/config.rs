//! Configuration for the sequencer, read from `.sequencer/sequencer.toml`.
//!
//! Values are layered: file → environment (`SEQUENCER_*`, with a `.env` file
//! loaded first) → command-line flags. Every field has a default, so an
//! empty or missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = ".sequencer/sequencer.db"
//! dev_mode = false
//! shutdown_grace_secs = 10
//!
//! [timing]
//! poll_interval_ms = 500
//! wait_ceiling_secs = 300
//! settle_delay_ms = 100
//! read_retry_delay_ms = 100
//! ttl_secs = 86400
//! purge_interval_secs = 600
//!
//! [limits]
//! max_topics = 20
//! max_concurrent_jobs = 4
//!
//! [generator]
//! url = "http://127.0.0.1:5000/generate"
//! timeout_secs = 120
//!
//! [[processors]]
//! name = "audio"
//! url = "http://127.0.0.1:5001/synthesize"
//! timeout_secs = 300
//!
//! [params]
//! allowed = ["Notion", "Linear", "Figma"]
//!
//! [logging]
//! format = "pretty"
//! filter = "info"
//! directory = ".sequencer/logs"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sequence::coordinator::CoordinatorOptions;
use crate::sequence::wait::Timing;

/// Directory holding the config file and the default database.
pub const CONFIG_DIR: &str = ".sequencer";
pub const CONFIG_FILE: &str = "sequencer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for local front-end development.
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("sequencer.db")
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_wait_ceiling_secs")]
    pub wait_ceiling_secs: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,
    /// Lifetime of sequence state after its last write.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_ceiling_secs: default_wait_ceiling_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
            ttl_secs: default_ttl_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_wait_ceiling_secs() -> u64 {
    300
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_read_retry_delay_ms() -> u64 {
    100
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_purge_interval_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_topics: default_max_topics(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

fn default_max_topics() -> usize {
    20
}

fn default_max_concurrent_jobs() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default = "default_generator_url")]
    pub url: String,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            url: default_generator_url(),
            timeout_secs: default_generator_timeout_secs(),
        }
    }
}

fn default_generator_url() -> String {
    "http://127.0.0.1:5000/generate".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    120
}

/// A downstream artifact processor (audio synthesis, publishing).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorSection {
    pub name: String,
    pub url: String,
    #[serde(default = "default_processor_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_processor_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamsSection {
    /// Allowed forced parameters. Empty means anything goes.
    #[serde(default)]
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// When set, logs also go to a daily rolling file in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
            directory: None,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// The complete sequencer.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequencerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub processors: Vec<ProcessorSection>,
    #[serde(default)]
    pub params: ParamsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl SequencerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse sequencer.toml")
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Full layered load: file, then `.env` and process environment. The
    /// result is validated.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        dotenvy::dotenv().ok();
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize sequencer.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay `SEQUENCER_*` variables obtained through `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
        }

        if let Some(v) = lookup("SEQUENCER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("SEQUENCER_PORT") {
            self.server.port = parsed("SEQUENCER_PORT", v)?;
        }
        if let Some(v) = lookup("SEQUENCER_DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SEQUENCER_DEV_MODE") {
            self.server.dev_mode = v != "false" && v != "0";
        }
        if let Some(v) = lookup("SEQUENCER_POLL_INTERVAL_MS") {
            self.timing.poll_interval_ms = parsed("SEQUENCER_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SEQUENCER_WAIT_CEILING_SECS") {
            self.timing.wait_ceiling_secs = parsed("SEQUENCER_WAIT_CEILING_SECS", v)?;
        }
        if let Some(v) = lookup("SEQUENCER_TTL_SECS") {
            self.timing.ttl_secs = parsed("SEQUENCER_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("SEQUENCER_MAX_TOPICS") {
            self.limits.max_topics = parsed("SEQUENCER_MAX_TOPICS", v)?;
        }
        if let Some(v) = lookup("SEQUENCER_MAX_CONCURRENT_JOBS") {
            self.limits.max_concurrent_jobs = parsed("SEQUENCER_MAX_CONCURRENT_JOBS", v)?;
        }
        if let Some(v) = lookup("SEQUENCER_GENERATOR_URL") {
            self.generator.url = v;
        }
        if let Some(v) = lookup("SEQUENCER_ALLOWED_PARAMS") {
            self.params.allowed = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("SEQUENCER_LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        if let Some(v) = lookup("SEQUENCER_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let t = &self.timing;
        for (name, value) in [
            ("timing.poll_interval_ms", t.poll_interval_ms),
            ("timing.wait_ceiling_secs", t.wait_ceiling_secs),
            ("timing.ttl_secs", t.ttl_secs),
            ("timing.purge_interval_secs", t.purge_interval_secs),
        ] {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", name));
            }
        }
        if self.limits.max_topics == 0 {
            problems.push("limits.max_topics must be greater than zero".to_string());
        }
        if self.limits.max_concurrent_jobs == 0 {
            problems.push("limits.max_concurrent_jobs must be greater than zero".to_string());
        }
        if self.generator.url.trim().is_empty() {
            problems.push("generator.url must not be empty".to_string());
        }
        for processor in &self.processors {
            if processor.name.trim().is_empty() || processor.url.trim().is_empty() {
                problems.push(format!(
                    "processor '{}' needs both a name and a url",
                    processor.name
                ));
            }
        }
        problems
    }

    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if !problems.is_empty() {
            bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }
        Ok(())
    }

    pub fn timing(&self) -> Timing {
        let t = &self.timing;
        Timing {
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            wait_ceiling: Duration::from_secs(t.wait_ceiling_secs),
            settle_delay: Duration::from_millis(t.settle_delay_ms),
            read_retry_delay: Duration::from_millis(t.read_retry_delay_ms),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.timing.ttl_secs)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            timing: self.timing(),
            max_topics: self.limits.max_topics,
            max_concurrent_jobs: self.limits.max_concurrent_jobs,
            allowed_params: self.params.allowed.clone(),
        }
    }
}

/// Default config file location below `root`.
pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}
