//! Configuration loading and validation.
//!
//! Settings come from `~/.phantom/config.toml` (or an explicit path), with
//! every section optional. Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dnauth::sequence::Complexity;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Governor policy settings.
    pub governor: GovernorConfig,

    /// Classifier pattern table.
    pub classifier: ClassifierConfig,

    /// DNAuth store limits.
    pub dnauth: DnauthConfig,

    /// QRNet registry settings.
    pub qrnet: QrnetConfig,

    /// Audit log settings.
    pub audit: AuditConfig,
}

/// Governor policy settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GovernorConfig {
    /// Ask an approval collaborator by default.
    #[serde(default)]
    pub interactive: bool,

    /// Decline HIGH and CRITICAL threats and high behaviour scores.
    #[serde(default)]
    pub strict: bool,

    /// Whether cache lookups may hit.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Maximum cached decisions.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Behaviour score at which strict mode declines.
    #[serde(default = "default_strict_score_threshold")]
    pub strict_score_threshold: u8,

    /// Default approval deadline in milliseconds.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,

    /// Newer decisions after which an approval can no longer be rolled back.
    #[serde(default = "default_rollback_window")]
    pub rollback_window: usize,

    /// Decisions kept in the history ring.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            interactive: false,
            strict: false,
            cache_enabled: true,
            cache_capacity: default_cache_capacity(),
            strict_score_threshold: default_strict_score_threshold(),
            approval_timeout_ms: default_approval_timeout_ms(),
            rollback_window: default_rollback_window(),
            history_capacity: default_history_capacity(),
        }
    }
}

/// Classifier pattern table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ClassifierConfig {
    /// TOML pattern table replacing the built-in one.
    #[serde(default)]
    pub table: Option<PathBuf>,
}

/// DNAuth store limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DnauthConfig {
    /// Shortest accepted sequence.
    #[serde(default = "default_min_sequence_len")]
    pub min_sequence_len: usize,

    /// Longest accepted sequence.
    #[serde(default = "default_max_sequence_len")]
    pub max_sequence_len: usize,

    /// Fuzzy tolerance when a user registers without one.
    #[serde(default = "default_max_mutations")]
    pub default_max_mutations: u32,

    /// Failures within `fail_window_ms` that trigger a lockout.
    #[serde(default = "default_fail_limit")]
    pub fail_limit: u32,

    /// Window over which failures are counted.
    #[serde(default = "default_fail_window_ms")]
    pub fail_window_ms: u64,

    /// First lockout duration; doubles on each consecutive lockout.
    #[serde(default = "default_lockout_ms")]
    pub lockout_ms: u64,

    /// Lockout ceiling.
    #[serde(default = "default_max_lockout_ms")]
    pub max_lockout_ms: u64,

    /// Maximum edit distance between consecutive generations.
    #[serde(default = "default_evolve_delta")]
    pub evolve_delta: u32,

    /// Deepest ancestor generation accepted.
    #[serde(default = "default_max_ancestor_depth")]
    pub max_ancestor_depth: u32,

    /// Verifier iterations for new registrations.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Weakest sequence accepted at registration.
    #[serde(default = "default_min_complexity")]
    pub min_complexity: Complexity,
}

impl Default for DnauthConfig {
    fn default() -> Self {
        Self {
            min_sequence_len: default_min_sequence_len(),
            max_sequence_len: default_max_sequence_len(),
            default_max_mutations: default_max_mutations(),
            fail_limit: default_fail_limit(),
            fail_window_ms: default_fail_window_ms(),
            lockout_ms: default_lockout_ms(),
            max_lockout_ms: default_max_lockout_ms(),
            evolve_delta: default_evolve_delta(),
            max_ancestor_depth: default_max_ancestor_depth(),
            kdf_iterations: default_kdf_iterations(),
            min_complexity: default_min_complexity(),
        }
    }
}

/// QRNet registry settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QrnetConfig {
    /// Longest accepted destination path.
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,

    /// Directory for the one-file-per-hash content store.
    #[serde(default)]
    pub content_dir: Option<PathBuf>,

    /// Expiry applied to codes created without one.
    #[serde(default)]
    pub default_expiry_ms: Option<u64>,
}

impl Default for QrnetConfig {
    fn default() -> Self {
        Self {
            max_path_len: default_max_path_len(),
            content_dir: None,
            default_expiry_ms: None,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuditConfig {
    /// PHGL file; memory-only when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Flush after every append.
    #[serde(default)]
    pub durable: bool,

    /// Events inspected for the health score.
    #[serde(default = "default_tail_window")]
    pub tail_window: usize,

    /// Decisions inspected for the threat trend.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            durable: false,
            tail_window: default_tail_window(),
            trend_window: default_trend_window(),
        }
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}
fn default_cache_capacity() -> usize {
    256
}
fn default_strict_score_threshold() -> u8 {
    60
}
fn default_approval_timeout_ms() -> u64 {
    30_000
}
fn default_rollback_window() -> usize {
    32
}
fn default_history_capacity() -> usize {
    1024
}
fn default_min_sequence_len() -> usize {
    12
}
fn default_max_sequence_len() -> usize {
    4096
}
fn default_max_mutations() -> u32 {
    3
}
fn default_fail_limit() -> u32 {
    5
}
fn default_fail_window_ms() -> u64 {
    900_000
}
fn default_lockout_ms() -> u64 {
    900_000
}
fn default_max_lockout_ms() -> u64 {
    86_400_000
}
fn default_evolve_delta() -> u32 {
    3
}
fn default_max_ancestor_depth() -> u32 {
    5
}
fn default_kdf_iterations() -> u32 {
    2048
}
fn default_min_complexity() -> Complexity {
    Complexity::Medium
}
fn default_max_path_len() -> usize {
    512
}
fn default_tail_window() -> usize {
    64
}
fn default_trend_window() -> usize {
    16
}

impl Config {
    /// Parse from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        for (var, slot) in [
            ("PHANTOM_STRICT", &mut self.governor.strict),
            ("PHANTOM_INTERACTIVE", &mut self.governor.interactive),
        ] {
            if let Some(v) = env(var) {
                match parse_flag(&v) {
                    Some(b) => *slot = b,
                    None => tracing::warn!(var, value = %v, "ignoring invalid env override"),
                }
            }
        }
        if let Some(v) = env("PHANTOM_AUDIT_PATH") {
            self.audit.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("PHANTOM_CONTENT_DIR") {
            self.qrnet.content_dir = Some(PathBuf::from(v));
        }
    }

    /// Reject settings the core cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let zero_capacity = [
            ("governor.cache_capacity", self.governor.cache_capacity),
            ("governor.history_capacity", self.governor.history_capacity),
            ("audit.tail_window", self.audit.tail_window),
            ("audit.trend_window", self.audit.trend_window),
            ("qrnet.max_path_len", self.qrnet.max_path_len),
        ];
        if let Some((name, _)) = zero_capacity.iter().find(|(_, v)| *v == 0) {
            anyhow::bail!("{name} must be greater than zero");
        }
        if self.dnauth.fail_limit < 5 {
            anyhow::bail!("dnauth.fail_limit must be at least 5");
        }
        if self.dnauth.min_sequence_len < 12 {
            anyhow::bail!("dnauth.min_sequence_len must be at least 12");
        }
        if self.dnauth.max_sequence_len < self.dnauth.min_sequence_len {
            anyhow::bail!("dnauth.max_sequence_len is below min_sequence_len");
        }
        if self.dnauth.kdf_iterations == 0 {
            anyhow::bail!("dnauth.kdf_iterations must be greater than zero");
        }
        Ok(())
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Load `~/.phantom/config.toml` (defaults when missing), apply env
/// overrides, and validate.
///
/// # Errors
///
/// Returns an error if the file exists but is invalid, or validation fails.
pub fn load_default_config() -> anyhow::Result<Config> {
    let path = config_dir()?.join("config.toml");
    let mut config = if path.exists() {
        load_config(&path)?
    } else {
        Config::default()
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.phantom/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".phantom"))
}
