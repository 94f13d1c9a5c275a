use anyhow::{Context, Result};
use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::debug;

use crate::core::quality::QualityPolicy;
use crate::core::request::RequestClass;
use crate::core::source::SourceId;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SourceSettings {
    pub base_url: String,
    /// Minimum spacing between two calls to this source.
    pub min_interval_ms: u64,
    pub timeout_ms: u64,
    pub enabled: bool,
    pub api_key: Option<String>,
}

impl SourceSettings {
    fn with_url(base_url: &str, min_interval_ms: u64) -> Self {
        SourceSettings {
            base_url: base_url.to_string(),
            min_interval_ms,
            timeout_ms: 10_000,
            enabled: true,
            api_key: None,
        }
    }

    pub fn min_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.min_interval_ms)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings::with_url("", 1_000)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    pub primary: SourceSettings,
    pub secondary: SourceSettings,
    pub tertiary: SourceSettings,
}

impl SourcesConfig {
    pub fn get(&self, id: SourceId) -> Option<&SourceSettings> {
        match id {
            SourceId::Primary => Some(&self.primary),
            SourceId::Secondary => Some(&self.secondary),
            SourceId::Tertiary => Some(&self.tertiary),
            SourceId::Synthetic => None,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        SourcesConfig {
            primary: SourceSettings::with_url("https://iss.moex.com/iss", 500),
            secondary: SourceSettings::with_url("https://query1.finance.yahoo.com", 1_000),
            tertiary: SourceSettings::with_url("https://www.alphavantage.co", 1_000),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub jitter_ms: u64,
    pub network_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            max_retries: 5,
            jitter_ms: 250,
            network_retries: 1,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TtlConfig {
    pub quote_secs: u64,
    pub intraday_secs: u64,
    pub historical_secs: u64,
}

impl TtlConfig {
    pub fn for_class(&self, class: RequestClass) -> Duration {
        let secs = match class {
            RequestClass::Quote => self.quote_secs,
            RequestClass::Intraday => self.intraday_secs,
            RequestClass::Historical => self.historical_secs,
        };
        Duration::seconds(secs as i64)
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        TtlConfig {
            quote_secs: 10,
            intraday_secs: 60,
            historical_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep a durable tier on disk next to the in-memory one.
    pub persist: bool,
    pub data_path: Option<String>,
    pub bucket_secs: u64,
    pub ttl: TtlConfig,
}

impl CacheConfig {
    pub fn bucket(&self) -> Duration {
        Duration::seconds(self.bucket_secs.max(1) as i64)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            persist: true,
            data_path: None,
            bucket_secs: 3_600,
            ttl: TtlConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Mean log-return per step.
    pub drift: f64,
    /// Standard deviation of the log-return per step.
    pub volatility: f64,
    pub base_price: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            drift: 0.0002,
            volatility: 0.02,
            base_price: 100.0,
        }
    }
}

fn default_priority() -> Vec<SourceId> {
    SourceId::NETWORK.to_vec()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DataServiceConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default = "default_priority")]
    pub priority: Vec<SourceId>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quality: QualityPolicy,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        DataServiceConfig {
            sources: SourcesConfig::default(),
            priority: default_priority(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            quality: QualityPolicy::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl DataServiceConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("dev", "marketfeed", "marketfeed")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.cache.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("dev", "marketfeed", "marketfeed")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    /// Enabled network sources in priority order, without duplicates.
    pub fn ordered_sources(&self) -> Vec<SourceId> {
        let mut ordered = Vec::new();
        for id in &self.priority {
            let enabled = self.sources.get(*id).is_some_and(|s| s.enabled);
            if enabled && !ordered.contains(id) {
                ordered.push(*id);
            }
        }
        ordered
    }
}
