//! Service configuration
//!
//! Defaults mirror the production settings; a TOML file and `CANOPY_*`
//! environment variables can override them.

use crate::types::{CanopyError, CanopyResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// First Sentinel-2 acquisition usable by the archive
pub const SENTINEL2_EPOCH: (i32, u32, u32) = (2015, 6, 23);

pub fn sentinel2_epoch() -> NaiveDate {
    let (y, m, d) = SENTINEL2_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

/// How `has_suitable_images` is decided for a cloud coverage check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuitabilityRule {
    /// Any available image with a recommended date counts
    BestAvailable,
    /// At least one image must meet the cloud threshold
    ThresholdOnly,
}

/// Progressive relaxation applied when no usable imagery is found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    /// Cloud thresholds tried after the requested one
    pub cloud_thresholds: Vec<f64>,
    /// Look-back windows in days, tried after every threshold failed
    pub window_days: Vec<i64>,
    /// Cloud threshold used for the look-back windows
    pub window_cloud_threshold: f64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            cloud_thresholds: vec![20.0, 30.0, 50.0, 80.0],
            window_days: vec![30, 90, 180, 365],
            window_cloud_threshold: 90.0,
        }
    }
}

/// Parameters of collection resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub imagery_epoch: NaiveDate,
    /// Tile-wide pre-filter factor applied before AOI scoring
    pub prefilter_factor: f64,
    pub suitability: SuitabilityRule,
    pub escalation: EscalationPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            imagery_epoch: sentinel2_epoch(),
            prefilter_factor: 2.0,
            suitability: SuitabilityRule::BestAvailable,
            escalation: EscalationPolicy::default(),
        }
    }
}

/// Top-level configuration of the index service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub max_cloud_coverage: f64,
    /// Pixel scale in meters
    pub default_scale: f64,
    pub max_pixels: u64,
    pub use_aoi_cloud_filter: bool,
    pub cloud_buffer_meters: f64,
    pub platform_timeout_secs: u64,
    pub platform_url: Option<String>,
    pub platform_key: Option<String>,
    pub cache_collections: bool,
    pub resolver: ResolverConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_cloud_coverage: 10.0,
            default_scale: 10.0,
            max_pixels: 10_000_000_000_000,
            use_aoi_cloud_filter: true,
            cloud_buffer_meters: 300.0,
            platform_timeout_secs: 120,
            platform_url: None,
            platform_key: None,
            cache_collections: false,
            resolver: ResolverConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn platform_timeout(&self) -> Duration {
        Duration::from_secs(self.platform_timeout_secs)
    }

    pub fn from_toml_str(content: &str) -> CanopyResult<Self> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> CanopyResult<Self> {
        log::info!("Loading configuration from: {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults with environment overrides only
    pub fn from_env() -> CanopyResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `CANOPY_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> CanopyResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CANOPY_MAX_CLOUD_COVERAGE") {
            self.max_cloud_coverage = parse_env("CANOPY_MAX_CLOUD_COVERAGE", &v)?;
        }
        if let Some(v) = lookup("CANOPY_DEFAULT_SCALE") {
            self.default_scale = parse_env("CANOPY_DEFAULT_SCALE", &v)?;
        }
        if let Some(v) = lookup("CANOPY_USE_AOI_CLOUD_FILTER") {
            self.use_aoi_cloud_filter = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = lookup("CANOPY_CLOUD_BUFFER_METERS") {
            self.cloud_buffer_meters = parse_env("CANOPY_CLOUD_BUFFER_METERS", &v)?;
        }
        if let Some(v) = lookup("CANOPY_PLATFORM_TIMEOUT_SECS") {
            self.platform_timeout_secs = parse_env("CANOPY_PLATFORM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CANOPY_PLATFORM_URL") {
            self.platform_url = Some(v);
        }
        if let Some(v) = lookup("CANOPY_PLATFORM_KEY") {
            self.platform_key = Some(v);
        }
        self.validate()
    }

    pub fn validate(&self) -> CanopyResult<()> {
        if !(0.0..=100.0).contains(&self.max_cloud_coverage) {
            return Err(CanopyError::Config(format!(
                "max_cloud_coverage must be within 0-100, got {}",
                self.max_cloud_coverage
            )));
        }
        if self.default_scale <= 0.0 {
            return Err(CanopyError::Config("default_scale must be positive".to_string()));
        }
        if self.cloud_buffer_meters < 0.0 {
            return Err(CanopyError::Config(
                "cloud_buffer_meters cannot be negative".to_string(),
            ));
        }
        if self.resolver.prefilter_factor < 1.0 {
            return Err(CanopyError::Config(
                "prefilter_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> CanopyResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CanopyError::Config(format!("Invalid value for {}: {}", key, value)))
}
