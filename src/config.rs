// src/config.rs
//! Client configuration: environment variables with defaults, optionally
//! overridden per environment from `premium.yaml`

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_API_URL: &str = "https://jobportalserver-production-0346.up.railway.app/api";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_AMOUNT: u64 = 99;
const DEFAULT_RECONCILE_DELAYS_MS: [u64; 3] = [1000, 2000, 3000];
const DEFAULT_CHECKOUT_URL: &str = "https://payments.cashfree.com/order/";
const DEFAULT_RETURN_URL: &str = "http://localhost:5173/resume-generator";
const CONFIG_FILE: &str = "premium.yaml";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    /// Outer bound shared with the AI generation path.
    pub http_timeout: Duration,
    /// Per-request bound for payment calls.
    pub payment_timeout: Duration,
    pub state_dir: PathBuf,
    pub default_amount: u64,
    /// Hosted checkout page that accepts a `payment_session_id`.
    pub checkout_url: String,
    /// Application page the processor sends the user back to.
    pub return_url: String,
    /// Waits between paid-status polls after a successful verify.
    pub reconcile_delays: Vec<Duration>,
}

/// One environment section of `premium.yaml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    api_base_url: Option<String>,
    http_timeout_secs: Option<u64>,
    payment_timeout_secs: Option<u64>,
    state_dir: Option<PathBuf>,
    default_amount: Option<u64>,
    checkout_url: Option<String>,
    return_url: Option<String>,
    reconcile_delays_ms: Option<Vec<u64>>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    local: FileOverrides,
    #[serde(default)]
    production: FileOverrides,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            payment_timeout: Duration::from_secs(DEFAULT_PAYMENT_TIMEOUT_SECS),
            state_dir: default_state_dir(),
            default_amount: DEFAULT_AMOUNT,
            checkout_url: DEFAULT_CHECKOUT_URL.to_string(),
            return_url: DEFAULT_RETURN_URL.to_string(),
            reconcile_delays: DEFAULT_RECONCILE_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl ClientConfig {
    /// Load from the environment, then apply `premium.yaml` from the current
    /// directory when it exists.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_env()?;

        let path = PathBuf::from(CONFIG_FILE);
        if path.exists() {
            config.apply_file(&path, &Self::get_environment())?;
        }

        info!(
            api = %config.api_base_url,
            state_dir = %config.state_dir.display(),
            "Client configuration loaded"
        );
        Ok(config)
    }

    fn get_environment() -> String {
        std::env::var("JOBPORTAL_ENV")
            .or_else(|_| std::env::var("ENVIRONMENT"))
            .unwrap_or_else(|_| "local".to_string())
    }

    /// Environment variables over built-in defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("JOBPORTAL_API_URL") {
            config.api_base_url = url;
        }
        if let Some(secs) = parse_env::<u64>("JOBPORTAL_HTTP_TIMEOUT_SECS")? {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("JOBPORTAL_PAYMENT_TIMEOUT_SECS")? {
            config.payment_timeout = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("JOBPORTAL_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(amount) = parse_env::<u64>("JOBPORTAL_PREMIUM_AMOUNT")? {
            config.default_amount = amount;
        }
        if let Ok(url) = std::env::var("JOBPORTAL_CHECKOUT_URL") {
            config.checkout_url = url;
        }
        if let Ok(url) = std::env::var("JOBPORTAL_RETURN_URL") {
            config.return_url = url;
        }
        if let Ok(raw) = std::env::var("JOBPORTAL_RECONCILE_DELAYS_MS") {
            config.reconcile_delays = parse_delays(&raw)
                .context("JOBPORTAL_RECONCILE_DELAYS_MS must be a comma separated list of milliseconds")?;
        }

        config.api_base_url = normalize_base_url(&config.api_base_url);
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path, environment: &str) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.apply_yaml(&content, environment)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply the section of a YAML document matching `environment`.
    pub fn apply_yaml(&mut self, content: &str, environment: &str) -> Result<()> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        let overrides = match environment {
            "production" => file.production,
            _ => file.local,
        };

        if let Some(url) = overrides.api_base_url {
            self.api_base_url = normalize_base_url(&url);
        }
        if let Some(secs) = overrides.http_timeout_secs {
            self.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.payment_timeout_secs {
            self.payment_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = overrides.state_dir {
            self.state_dir = dir;
        }
        if let Some(amount) = overrides.default_amount {
            self.default_amount = amount;
        }
        if let Some(url) = overrides.checkout_url {
            self.checkout_url = url;
        }
        if let Some(url) = overrides.return_url {
            self.return_url = url;
        }
        if let Some(delays) = overrides.reconcile_delays_ms {
            self.reconcile_delays = delays.into_iter().map(Duration::from_millis).collect();
        }

        if self.payment_timeout > self.http_timeout {
            warn!("Payment timeout exceeds the outer HTTP timeout, clamping");
            self.payment_timeout = self.http_timeout;
        }
        Ok(())
    }

    /// Total time the coordinator may spend reconciling after a successful verify.
    pub fn grace_budget(&self) -> Duration {
        self.reconcile_delays.iter().sum()
    }

    pub fn with_api_base_url(mut self, url: &str) -> Self {
        self.api_base_url = normalize_base_url(url);
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    pub fn with_reconcile_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconcile_delays = delays;
        self
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".jobportal"))
        .unwrap_or_else(|_| PathBuf::from(".jobportal"))
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn parse_delays(raw: &str) -> Result<Vec<Duration>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("Invalid delay: {}", s))
        })
        .collect()
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
