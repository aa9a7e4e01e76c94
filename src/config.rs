// src/config.rs
//! Resolved runtime configuration.
//!
//! Loaded once at process start from TOML or JSON; every tunable has a
//! serde default so a minimal file only needs to list sites. Hot reload is
//! out of scope. Selector strings are validated (compiled and dropped) at
//! load time so a typo fails startup instead of a 3 a.m. scan cycle.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_CONFIG_PATH: &str = "SCANNER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/scanner.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub sites: Vec<WebsiteConfig>,
    /// Default seconds between scans of one site (overridable per site).
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Upper bound on simultaneously running site cycles.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_cycles: usize,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsiteConfig {
    /// Short stable identifier; part of every article fingerprint.
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `scan_interval_secs` for this site.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub selectors: ExtractionRules,
}

impl WebsiteConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Per-site CSS selector rules. Absence of a sub-selector is valid
/// configuration: the matching field is simply left empty on extraction.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionRules {
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_title_sel")]
    pub title: Option<String>,
    #[serde(default = "default_body_sel")]
    pub body: Option<String>,
    #[serde(default = "default_image_sel")]
    pub image: Option<String>,
    #[serde(default = "default_link_sel")]
    pub link: Option<String>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            container: default_container(),
            title: default_title_sel(),
            body: default_body_sel(),
            image: default_image_sel(),
            link: default_link_sel(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// When false, fetches go out directly and rotation is a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default)]
    pub control_password: String,
    /// Voluntary rotations are refused within this window of the last one.
    #[serde(default = "default_min_rotation")]
    pub min_rotation_interval_secs: u64,
    /// Each forced rotation delays the next voluntary one by this much.
    #[serde(default = "default_forced_cooldown")]
    pub forced_rotation_cooldown_secs: u64,
    /// Consecutive failures on one identity before autonomous rotation.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socks_addr: default_socks_addr(),
            control_addr: default_control_addr(),
            control_password: String::new(),
            min_rotation_interval_secs: default_min_rotation(),
            forced_rotation_cooldown_secs: default_forced_cooldown(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// HTTP statuses treated as blocking rather than plain failure.
    #[serde(default = "default_blocked_statuses")]
    pub blocked_status_codes: Vec<u16>,
    /// Body smaller than `ratio * rolling mean` counts as blocked.
    #[serde(default = "default_blocked_ratio")]
    pub blocked_size_ratio: f64,
    /// The size heuristic stays disarmed until this many successful
    /// fetches have been observed for the site.
    #[serde(default = "default_min_size_samples")]
    pub min_size_samples: usize,
    #[serde(default = "default_size_window")]
    pub size_window: usize,
    /// Characters of normalized body included in the fingerprint.
    #[serde(default = "default_fp_prefix")]
    pub fingerprint_body_prefix: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            blocked_status_codes: default_blocked_statuses(),
            blocked_size_ratio: default_blocked_ratio(),
            min_size_samples: default_min_size_samples(),
            size_window: default_size_window(),
            fingerprint_body_prefix: default_fp_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub priority_keywords: Vec<String>,
    /// Accepted strictly above this; a tie is rejected.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Weights and bias are clamped to `[-clamp, clamp]`.
    #[serde(default = "default_weight_clamp")]
    pub weight_clamp: f32,
    /// Normalized title+body shorter than this is rejected before scoring.
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            blacklist: Vec::new(),
            priority_keywords: Vec::new(),
            accept_threshold: default_accept_threshold(),
            learning_rate: default_learning_rate(),
            weight_clamp: default_weight_clamp(),
            min_content_length: default_min_content_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Seen-records expire after this long; expiry is checked lazily.
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// A degraded site's interval is multiplied by this until a success.
    #[serde(default = "default_backoff_factor")]
    pub degraded_backoff_factor: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            degraded_backoff_factor: default_backoff_factor(),
            max_backoff_multiplier: default_max_backoff(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_scan_interval() -> u64 {
    3600
}
fn default_max_concurrent() -> usize {
    4
}
fn default_grace() -> u64 {
    30
}
fn default_container() -> String {
    "article".into()
}
fn default_title_sel() -> Option<String> {
    Some("h1, h2, .title".into())
}
fn default_body_sel() -> Option<String> {
    Some(".content, p".into())
}
fn default_image_sel() -> Option<String> {
    Some("img".into())
}
fn default_link_sel() -> Option<String> {
    Some("a".into())
}
fn default_socks_addr() -> String {
    "127.0.0.1:9050".into()
}
fn default_control_addr() -> String {
    "127.0.0.1:9051".into()
}
fn default_min_rotation() -> u64 {
    300
}
fn default_forced_cooldown() -> u64 {
    120
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".into()
}
fn default_blocked_statuses() -> Vec<u16> {
    vec![403, 429, 503]
}
fn default_blocked_ratio() -> f64 {
    0.2
}
fn default_min_size_samples() -> usize {
    3
}
fn default_size_window() -> usize {
    20
}
fn default_fp_prefix() -> usize {
    256
}
fn default_accept_threshold() -> f32 {
    0.6
}
fn default_learning_rate() -> f32 {
    0.1
}
fn default_weight_clamp() -> f32 {
    5.0
}
fn default_min_content_length() -> usize {
    100
}
fn default_dedup_ttl() -> u64 {
    86_400
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_backoff() -> f64 {
    8.0
}

impl ScannerConfig {
    /// Load from an explicit path. Supports TOML or JSON.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading scanner config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = Self::parse(&content, &ext)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using `$SCANNER_CONFIG_PATH`, falling back to
    /// `config/scanner.toml`.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::from_path(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to a non-existent path"));
        }
        Self::from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).context("parsing scanner config (toml)")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(s: &str, hint_ext: &str) -> Result<Self> {
        if hint_ext == "json" {
            return serde_json::from_str(s).context("parsing scanner config (json)");
        }
        toml::from_str(s).context("parsing scanner config (toml)")
    }

    /// Reject configs a cycle would trip over: duplicate site ids, bad
    /// urls, malformed selectors, nonsensical thresholds.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for site in &self.sites {
            if site.id.trim().is_empty() {
                return Err(anyhow!("site with url {} has an empty id", site.url));
            }
            if !seen.insert(site.id.as_str()) {
                return Err(anyhow!("duplicate site id `{}`", site.id));
            }
            url::Url::parse(&site.url)
                .map_err(|e| anyhow!("site `{}` url invalid: {e}", site.id))?;
            crate::fetch::CompiledRules::compile(&site.selectors)
                .map_err(|e| anyhow!("site `{}` selectors invalid: {e}", site.id))?;
        }
        if !(0.0..=1.0).contains(&self.classifier.accept_threshold) {
            return Err(anyhow!(
                "classifier.accept_threshold must be in [0, 1], got {}",
                self.classifier.accept_threshold
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.max_concurrent_cycles == 0 {
            return Err(anyhow!("max_concurrent_cycles must be at least 1"));
        }
        Ok(())
    }

    /// Effective base interval for one site, before degradation backoff.
    pub fn site_interval_secs(&self, site: &WebsiteConfig) -> u64 {
        site.interval_secs.unwrap_or(self.scan_interval_secs)
    }
}
