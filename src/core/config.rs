use crate::core::errors::ConfigError;
use crate::core::types::{ExplanationMode, UsageTier};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub max_upload_mb: usize,
}

/// Region detector configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Adaptive threshold neighbourhood size in pixels (odd, >= 3)
    pub block_size: u32,
    /// Constant subtracted from the Gaussian-weighted local mean
    pub threshold_offset: f32,
    /// Rectangles with area <= this are noise
    pub min_area: u64,
    /// Rectangles with max(w/h, h/w) >= this are rule lines
    pub max_aspect_ratio: f64,
    /// Merge gap as a fraction of image width
    pub gap_ratio: f64,
    /// Concurrent detection passes across all requests
    pub max_concurrent_detections: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            block_size: 11,
            threshold_offset: 2.0,
            min_area: 20,
            max_aspect_ratio: 15.0,
            gap_ratio: 0.03,
            max_concurrent_detections: num_cpus::get().max(1),
        }
    }
}

/// LLM API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_keys: Vec<String>,
    pub base_url: String,
    pub recognition_model: String,
    pub fast_model: String,
    pub standard_model: String,
    pub quality_model: String,
    pub request_timeout: Duration,
    /// Leave model thinking on (off keeps latency and token usage down)
    pub enable_thinking: bool,
}

impl ApiConfig {
    pub fn model_for(&self, mode: ExplanationMode) -> &str {
        match mode {
            ExplanationMode::Fast => &self.fast_model,
            ExplanationMode::Standard => &self.standard_model,
            ExplanationMode::Quality => &self.quality_model,
        }
    }
}

/// Batch generation configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Attempts per generation call (first try included)
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Per-attempt timeout for generation calls
    pub generation_timeout: Duration,
    /// Per-attempt timeout for recognition calls
    pub recognition_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(120),
            recognition_timeout: Duration::from_secs(60),
        }
    }
}

/// Limits for one usage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub fast: u32,
    pub standard: u32,
    pub quality: u32,
    pub export: u32,
}

impl TierLimits {
    pub fn for_mode(&self, mode: ExplanationMode) -> u32 {
        match mode {
            ExplanationMode::Fast => self.fast,
            ExplanationMode::Standard => self.standard,
            ExplanationMode::Quality => self.quality,
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub tiers: HashMap<UsageTier, TierLimits>,
    /// Offset from UTC used to decide where a day or month starts
    pub utc_offset_hours: i32,
}

impl QuotaConfig {
    pub fn limits(&self, tier: UsageTier) -> TierLimits {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| default_limits(tier))
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let tiers = [UsageTier::Free, UsageTier::Standard, UsageTier::Pro]
            .into_iter()
            .map(|tier| (tier, default_limits(tier)))
            .collect();
        Self {
            tiers,
            utc_offset_hours: 9,
        }
    }
}

fn default_limits(tier: UsageTier) -> TierLimits {
    match tier {
        UsageTier::Free => TierLimits {
            fast: 10,
            standard: 5,
            quality: 2,
            export: 3,
        },
        UsageTier::Standard => TierLimits {
            fast: 100,
            standard: 50,
            quality: 20,
            export: 30,
        },
        UsageTier::Pro => TierLimits {
            fast: 500,
            standard: 300,
            quality: 100,
            export: 200,
        },
    }
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub api: ApiConfig,
    pub batch: BatchConfig,
    pub quota: QuotaConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults, ignoring the environment
    pub fn defaults() -> Self {
        Self {
            server: ServerConfig {
                port: 1420,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                max_upload_mb: 100,
            },
            detection: DetectionConfig::default(),
            api: ApiConfig {
                api_keys: Vec::new(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                recognition_model: "gemini-2.5-flash".to_string(),
                fast_model: "gemini-2.5-flash-lite".to_string(),
                standard_model: "gemini-2.5-flash".to_string(),
                quality_model: "gemini-2.5-pro".to_string(),
                request_timeout: Duration::from_secs(180),
                enable_thinking: false,
            },
            batch: BatchConfig::default(),
            quota: QuotaConfig::default(),
        }
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        // Comma-separated key list
        let api_keys = env::var("GEMINI_API_KEYS")
            .ok()
            .map(|keys| {
                keys.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let detection_defaults = DetectionConfig::default();
        let batch_defaults = BatchConfig::default();
        let quota_defaults = QuotaConfig::default();

        let mut tiers = quota_defaults.tiers.clone();
        for (tier, var) in [
            (UsageTier::Free, "QUOTA_FREE"),
            (UsageTier::Standard, "QUOTA_STANDARD"),
            (UsageTier::Pro, "QUOTA_PRO"),
        ] {
            if let Ok(raw) = env::var(var) {
                let limits = parse_tier_limits(&raw, default_limits(tier))?;
                tiers.insert(tier, limits);
            }
        }

        Ok(Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT").unwrap_or(1420),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                max_upload_mb: env_parse("MAX_UPLOAD_MB").unwrap_or(100),
            },
            detection: DetectionConfig {
                block_size: env_parse("DETECTION_BLOCK_SIZE").unwrap_or(detection_defaults.block_size),
                threshold_offset: env_parse("DETECTION_THRESHOLD_OFFSET")
                    .unwrap_or(detection_defaults.threshold_offset),
                min_area: env_parse("DETECTION_MIN_AREA").unwrap_or(detection_defaults.min_area),
                max_aspect_ratio: env_parse("DETECTION_MAX_ASPECT_RATIO")
                    .unwrap_or(detection_defaults.max_aspect_ratio),
                gap_ratio: env_parse("DETECTION_GAP_RATIO").unwrap_or(detection_defaults.gap_ratio),
                max_concurrent_detections: env_parse("MAX_CONCURRENT_DETECTIONS")
                    .unwrap_or(detection_defaults.max_concurrent_detections),
            },
            api: ApiConfig {
                api_keys,
                base_url: env::var("GEMINI_BASE_URL").unwrap_or_else(|_| {
                    "https://generativelanguage.googleapis.com/v1beta".to_string()
                }),
                recognition_model: env::var("RECOGNITION_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                fast_model: env::var("FAST_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash-lite".to_string()),
                standard_model: env::var("STANDARD_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                quality_model: env::var("QUALITY_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-pro".to_string()),
                request_timeout: Duration::from_secs(
                    env_parse("API_TIMEOUT_SECONDS").unwrap_or(180),
                ),
                enable_thinking: env_parse("GEMINI_ENABLE_THINKING").unwrap_or(false),
            },
            batch: BatchConfig {
                max_attempts: env_parse("MAX_ATTEMPTS").unwrap_or(batch_defaults.max_attempts),
                retry_base_delay: env_parse("RETRY_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(batch_defaults.retry_base_delay),
                retry_max_delay: env_parse("RETRY_MAX_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(batch_defaults.retry_max_delay),
                generation_timeout: env_parse("GENERATION_TIMEOUT_SECONDS")
                    .map(Duration::from_secs)
                    .unwrap_or(batch_defaults.generation_timeout),
                recognition_timeout: env_parse("RECOGNITION_TIMEOUT_SECONDS")
                    .map(Duration::from_secs)
                    .unwrap_or(batch_defaults.recognition_timeout),
            },
            quota: QuotaConfig {
                tiers,
                utc_offset_hours: env_parse("QUOTA_UTC_OFFSET_HOURS")
                    .unwrap_or(quota_defaults.utc_offset_hours),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let detection = &self.detection;
        if detection.block_size < 3 || detection.block_size % 2 == 0 {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "block_size must be odd and >= 3, got {}",
                detection.block_size
            )));
        }
        if !(detection.gap_ratio > 0.0 && detection.gap_ratio < 1.0) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "gap_ratio must be in (0, 1), got {}",
                detection.gap_ratio
            )));
        }
        if detection.max_aspect_ratio <= 1.0 {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "max_aspect_ratio must be > 1, got {}",
                detection.max_aspect_ratio
            )));
        }
        if detection.max_concurrent_detections == 0 {
            return Err(ConfigError::InvalidBatchSize(detection.max_concurrent_detections));
        }

        if self.batch.max_attempts == 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch.max_attempts as usize));
        }
        if self.batch.retry_base_delay > self.batch.retry_max_delay {
            return Err(ConfigError::InvalidApiConfig(
                "retry base delay must not exceed max delay".to_string(),
            ));
        }
        if self.api.request_timeout.is_zero() || self.batch.generation_timeout.is_zero() {
            return Err(ConfigError::InvalidApiConfig(
                "timeouts must be > 0".to_string(),
            ));
        }

        if !(-12..=14).contains(&self.quota.utc_offset_hours) {
            return Err(ConfigError::InvalidQuotaConfig(format!(
                "utc_offset_hours must be between -12 and 14, got {}",
                self.quota.utc_offset_hours
            )));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn api_keys(&self) -> &[String] {
        &self.api.api_keys
    }
}

/// Parses `fast:10,standard:5,quality:2,export:3`; missing entries keep `base`
fn parse_tier_limits(raw: &str, base: TierLimits) -> Result<TierLimits, ConfigError> {
    let mut limits = base;
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = part.split_once(':').ok_or_else(|| {
            ConfigError::InvalidQuotaConfig(format!("expected name:limit, got '{}'", part))
        })?;
        let value: u32 = value.trim().parse().map_err(|_| {
            ConfigError::InvalidQuotaConfig(format!("invalid limit in '{}'", part))
        })?;
        match name.trim() {
            "fast" => limits.fast = value,
            "standard" => limits.standard = value,
            "quality" => limits.quality = value,
            "export" => limits.export = value,
            other => {
                return Err(ConfigError::InvalidQuotaConfig(format!(
                    "unknown counter '{}'",
                    other
                )))
            }
        }
    }
    Ok(limits)
}
