//! Application configuration for leadharvest.
//!
//! User config lives at `~/.leadharvest/leadharvest.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadharvest";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "leadharvest.db";

// ---------------------------------------------------------------------------
// Config structs (matching leadharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub harvest: HarvestConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub quality: QualityConfig,
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Public search page of the directory.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Minimum ms between any two directory requests.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            min_delay_ms: default_min_delay_ms(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://reports.myreca.ca/publicsearch.aspx".into()
}
fn default_min_delay_ms() -> u64 {
    1500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("leadharvest/{}", env!("CARGO_PKG_VERSION"))
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per page, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random jitter added to each backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter_ms() -> u64 {
    250
}

/// `[harvest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Processed records between checkpoint writes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Directory holding checkpoint files. Defaults to the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,

    /// Database path. Defaults to `leadharvest.db` in the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            state_dir: None,
            database: None,
        }
    }
}

fn default_batch_size() -> usize {
    50
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Confidence of addresses from the directory's detail view.
    #[serde(default = "default_directory_confidence")]
    pub directory_confidence: f64,

    /// Confidence of name-matched addresses found on the organization's site.
    #[serde(default = "default_site_confidence")]
    pub site_confidence: f64,

    /// Initial confidence of a pattern matching a known template.
    #[serde(default = "default_pattern_initial_confidence")]
    pub pattern_initial_confidence: f64,

    /// Initial confidence of an inferred custom template.
    #[serde(default = "default_pattern_custom_confidence")]
    pub pattern_custom_confidence: f64,

    /// Confidence step applied on each reinforcing observation.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Patterns are applied only above this confidence (exclusive).
    #[serde(default = "default_pattern_min_confidence")]
    pub pattern_min_confidence: f64,

    /// Multiplier from pattern confidence to result confidence.
    #[serde(default = "default_pattern_scale")]
    pub pattern_scale: f64,

    #[serde(default = "default_guess_confidence")]
    pub guess_confidence: f64,

    /// TLD appended to slugified organization names.
    #[serde(default = "default_tld")]
    pub tld: String,

    /// Templates tried, in order, for last-resort guesses.
    #[serde(default = "default_guess_templates")]
    pub guess_templates: Vec<String>,

    /// Domains that never yield organization patterns.
    #[serde(default = "default_free_mail_domains")]
    pub free_mail_domains: Vec<String>,

    /// Organization name fragment to canonical domain.
    #[serde(default = "default_franchise_aliases")]
    pub franchise_aliases: BTreeMap<String, String>,

    /// Paths tried on an organization's site.
    #[serde(default = "default_site_paths")]
    pub site_paths: Vec<String>,

    /// Minimum ms between requests to the same organization domain.
    #[serde(default = "default_site_min_delay_ms")]
    pub site_min_delay_ms: u64,

    /// Whether to visit organization sites at all.
    #[serde(default = "default_true")]
    pub site_lookup: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            directory_confidence: default_directory_confidence(),
            site_confidence: default_site_confidence(),
            pattern_initial_confidence: default_pattern_initial_confidence(),
            pattern_custom_confidence: default_pattern_custom_confidence(),
            learning_rate: default_learning_rate(),
            pattern_min_confidence: default_pattern_min_confidence(),
            pattern_scale: default_pattern_scale(),
            guess_confidence: default_guess_confidence(),
            tld: default_tld(),
            guess_templates: default_guess_templates(),
            free_mail_domains: default_free_mail_domains(),
            franchise_aliases: default_franchise_aliases(),
            site_paths: default_site_paths(),
            site_min_delay_ms: default_site_min_delay_ms(),
            site_lookup: true,
        }
    }
}

impl EnrichmentConfig {
    pub fn site_min_delay(&self) -> Duration {
        Duration::from_millis(self.site_min_delay_ms)
    }

    /// Whether `domain` is a free-mail provider.
    pub fn is_free_mail(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        self.free_mail_domains.iter().any(|d| *d == domain)
    }
}

fn default_directory_confidence() -> f64 {
    0.8
}
fn default_site_confidence() -> f64 {
    1.0
}
fn default_pattern_initial_confidence() -> f64 {
    0.7
}
fn default_pattern_custom_confidence() -> f64 {
    0.5
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_pattern_min_confidence() -> f64 {
    0.5
}
fn default_pattern_scale() -> f64 {
    0.9
}
fn default_guess_confidence() -> f64 {
    0.3
}
fn default_tld() -> String {
    "ca".into()
}
fn default_guess_templates() -> Vec<String> {
    [
        "{first}",
        "{first}.{last}",
        "{f}{last}",
        "{first}{l}",
        "{first}.{l}",
        "{last}",
        "{last}{f}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_free_mail_domains() -> Vec<String> {
    [
        "gmail.com",
        "outlook.com",
        "yahoo.ca",
        "yahoo.com",
        "hotmail.com",
        "icloud.com",
        "telus.net",
        "shaw.ca",
        "rogers.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_franchise_aliases() -> BTreeMap<String, String> {
    [
        ("re/max", "remax.ca"),
        ("remax", "remax.ca"),
        ("century 21", "century21.ca"),
        ("royal lepage", "royallepage.ca"),
        ("sotheby's", "sothebysrealty.ca"),
        ("sothebys", "sothebysrealty.ca"),
        ("exp realty", "exprealty.ca"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_site_paths() -> Vec<String> {
    ["/", "/contact", "/agents", "/our-team", "/about"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_site_min_delay_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}

/// `[quality]` section: lead score weights, summed to a 0-100 score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_email_weight")]
    pub email_weight: u32,
    #[serde(default = "default_phone_weight")]
    pub phone_weight: u32,
    #[serde(default = "default_organization_weight")]
    pub organization_weight: u32,
    #[serde(default = "default_city_weight")]
    pub city_weight: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            email_weight: default_email_weight(),
            phone_weight: default_phone_weight(),
            organization_weight: default_organization_weight(),
            city_weight: default_city_weight(),
        }
    }
}

fn default_email_weight() -> u32 {
    40
}
fn default_phone_weight() -> u32 {
    30
}
fn default_organization_weight() -> u32 {
    20
}
fn default_city_weight() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// Validation and resolved paths
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(HarvestError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(HarvestError::config("retry.multiplier must be >= 1.0"));
        }
        if self.harvest.batch_size == 0 {
            return Err(HarvestError::config("harvest.batch_size must be at least 1"));
        }
        let e = &self.enrichment;
        for (name, value) in [
            ("directory_confidence", e.directory_confidence),
            ("site_confidence", e.site_confidence),
            ("pattern_initial_confidence", e.pattern_initial_confidence),
            ("pattern_custom_confidence", e.pattern_custom_confidence),
            ("pattern_min_confidence", e.pattern_min_confidence),
            ("pattern_scale", e.pattern_scale),
            ("guess_confidence", e.guess_confidence),
            ("learning_rate", e.learning_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HarvestError::config(format!(
                    "enrichment.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if e.tld.trim().is_empty() {
            return Err(HarvestError::config("enrichment.tld must not be empty"));
        }
        url::Url::parse(&self.fetch.base_url).map_err(|err| {
            HarvestError::config(format!("fetch.base_url '{}': {err}", self.fetch.base_url))
        })?;
        Ok(())
    }

    /// Directory for checkpoint files.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.harvest.state_dir {
            Some(dir) => Ok(expand_home(dir)),
            None => config_dir(),
        }
    }

    /// Path of the record database.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.harvest.database {
            Some(path) => Ok(expand_home(path)),
            None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadharvest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadharvest/leadharvest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file to `path` (or the default location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| HarvestError::io(dir, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("min_delay_ms"));
        assert!(toml_str.contains("remax.ca"));
        assert!(toml_str.contains("[quality]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.retry.max_attempts, 4);
        assert_eq!(parsed.harvest.batch_size, 50);
        assert_eq!(parsed.enrichment.guess_templates[0], "{first}");
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
[fetch]
min_delay_ms = 250

[enrichment]
tld = "com"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.fetch.min_delay(), Duration::from_millis(250));
        assert_eq!(config.fetch.timeout_secs, 30);
        assert_eq!(config.enrichment.tld, "com");
        assert_eq!(config.enrichment.pattern_min_confidence, 0.5);
        assert_eq!(config.quality.email_weight, 40);
    }

    #[test]
    fn defaults_match_documented_values() {
        let e = EnrichmentConfig::default();
        assert_eq!(e.directory_confidence, 0.8);
        assert_eq!(e.site_confidence, 1.0);
        assert_eq!(e.pattern_scale, 0.9);
        assert_eq!(e.guess_confidence, 0.3);
        assert_eq!(e.site_min_delay(), Duration::from_secs(5));
        assert_eq!(
            e.franchise_aliases.get("century 21").map(String::as_str),
            Some("century21.ca")
        );
        assert!(e.is_free_mail("Gmail.com"));
        assert!(!e.is_free_mail("remax.ca"));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = AppConfig::default();
        config.enrichment.guess_confidence = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("guess_confidence"));

        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.fetch.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_paths_override_defaults() {
        let mut config = AppConfig::default();
        config.harvest.database = Some("/tmp/lh/test.db".into());
        config.harvest.state_dir = Some("/tmp/lh/state".into());
        assert_eq!(
            config.database_path().expect("db path"),
            PathBuf::from("/tmp/lh/test.db")
        );
        assert_eq!(
            config.state_dir().expect("state dir"),
            PathBuf::from("/tmp/lh/state")
        );
    }

    #[test]
    fn load_and_init_config_file() {
        let dir = std::env::temp_dir().join(format!("lh-config-{}", uuid::Uuid::now_v7()));
        let path = dir.join("leadharvest.toml");

        let written = init_config(Some(&path)).expect("init");
        assert_eq!(written, path);

        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.fetch.min_delay_ms, 1500);

        std::fs::write(&path, "[retry]\nmax_attempts = 0\n").expect("write");
        assert!(load_config_from(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
