use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, ScribeError};

fn parse_env_or<T: FromStr>(var: &str, default: T) -> T
where
    T::Err: fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: FromStr>(var: &str) -> Option<T>
where
    T::Err: fmt::Display,
{
    match env::var(var) {
        Ok(val) if val.trim().is_empty() => None,
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

/// Parse a comma-separated list such as `eng,chi_sim,jpn`.
fn parse_env_list(var: &str, default: &[&str]) -> Vec<String> {
    match env::var(var) {
        Ok(val) if !val.trim().is_empty() => val
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub ocr: OcrConfig,
    pub preprocessing: PreprocessingConfig,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdio" => Ok(Transport::Stdio),
            "http" => Ok(Transport::Http),
            other => Err(format!("unknown transport '{other}', expected stdio or http")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub mcp_path: String,
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Default Tesseract language string, e.g. `eng` or `eng+chi_sim`.
    pub language: String,
    pub data_path: Option<String>,
    pub page_seg_mode: Option<u32>,
    pub whitelist: Option<String>,
    /// Empty means ask the engine, which scans `data_path`.
    pub supported_languages: Vec<String>,
    /// Maximum accepted image payload in bytes.
    pub max_image_size: usize,
    pub timeout_secs: u64,
    pub engine_pool_size: usize,
}

impl OcrConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarizationMode {
    /// Global threshold picked by Otsu's method.
    Otsu,
    /// Local mean threshold over `adaptive_block_size` minus `adaptive_c`.
    Adaptive,
}

impl FromStr for BinarizationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "otsu" => Ok(BinarizationMode::Otsu),
            "adaptive" => Ok(BinarizationMode::Adaptive),
            other => Err(format!(
                "unknown binarization mode '{other}', expected otsu or adaptive"
            )),
        }
    }
}

/// Quality thresholds driving adaptive step selection.
#[derive(Debug, Clone)]
pub struct QualityThresholds {
    /// Laplacian variance below which the image is treated as blurry/noisy.
    pub sharpness: f64,
    /// Intensity standard deviation below which contrast is enhanced.
    pub contrast: f64,
    pub brightness_min: f64,
    pub brightness_max: f64,
    /// Skew (degrees) above which deskew is scheduled.
    pub skew_angle: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            sharpness: 100.0,
            contrast: 40.0,
            brightness_min: 80.0,
            brightness_max: 200.0,
            skew_angle: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessingConfig {
    pub enabled: bool,
    pub auto_mode: bool,
    pub grayscale: bool,
    pub denoise: bool,
    /// Median filter kernel size; even values are rounded up.
    pub denoise_strength: u32,
    pub binarization: bool,
    pub binarization_mode: BinarizationMode,
    pub adaptive_block_size: u32,
    pub adaptive_c: f64,
    pub deskew_correction: bool,
    pub deskew_angle_limit: f64,
    pub resize: bool,
    pub resize_width: u32,
    pub resize_height: u32,
    pub brightness_delta: i32,
    pub quality_thresholds: QualityThresholds,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_mode: true,
            grayscale: true,
            denoise: true,
            denoise_strength: 5,
            binarization: true,
            binarization_mode: BinarizationMode::Otsu,
            adaptive_block_size: 11,
            adaptive_c: 2.0,
            deskew_correction: true,
            deskew_angle_limit: 10.0,
            resize: false,
            resize_width: 0,
            resize_height: 0,
            brightness_delta: 30,
            quality_thresholds: QualityThresholds::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub worker_pool_size: usize,
    pub queue_size: usize,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    pub cache_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}', expected console or json")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Reported when neither the environment nor tessdata names any language.
pub const DEFAULT_SUPPORTED_LANGUAGES: &[&str] = &["eng", "chi_sim", "chi_tra", "jpn"];
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Default for Config {
    fn default() -> Self {
        let defaults = PreprocessingConfig::default();
        let thresholds = QualityThresholds::default();

        Self {
            server: ServerConfig {
                name: env::var("SCRIBE_SERVER_NAME").unwrap_or_else(|_| "scribe".to_string()),
                transport: parse_env_or("SCRIBE_TRANSPORT", Transport::Stdio),
                host: env::var("SCRIBE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: parse_env_or("SCRIBE_PORT", 3100),
                mcp_path: env::var("SCRIBE_MCP_PATH").unwrap_or_else(|_| "/mcp".to_string()),
            },
            ocr: OcrConfig {
                language: env::var("OCR_LANGUAGE").unwrap_or_else(|_| "eng".to_string()),
                data_path: env::var("TESSDATA_PREFIX").ok(),
                page_seg_mode: parse_env_opt("OCR_PAGE_SEG_MODE").or(Some(3)),
                whitelist: parse_env_opt("OCR_WHITELIST"),
                supported_languages: parse_env_list("OCR_SUPPORTED_LANGUAGES", &[]),
                max_image_size: parse_env_or("OCR_MAX_IMAGE_SIZE", 10 * 1024 * 1024),
                timeout_secs: parse_env_or("OCR_TIMEOUT", 30),
                engine_pool_size: parse_env_or("OCR_ENGINE_POOL_SIZE", 2),
            },
            preprocessing: PreprocessingConfig {
                enabled: parse_env_or("PREPROCESS_ENABLED", defaults.enabled),
                auto_mode: parse_env_or("PREPROCESS_AUTO_MODE", defaults.auto_mode),
                grayscale: parse_env_or("PREPROCESS_GRAYSCALE", defaults.grayscale),
                denoise: parse_env_or("PREPROCESS_DENOISE", defaults.denoise),
                denoise_strength: parse_env_or(
                    "PREPROCESS_DENOISE_STRENGTH",
                    defaults.denoise_strength,
                ),
                binarization: parse_env_or("PREPROCESS_BINARIZATION", defaults.binarization),
                binarization_mode: parse_env_or(
                    "PREPROCESS_BINARIZATION_MODE",
                    defaults.binarization_mode,
                ),
                adaptive_block_size: parse_env_or(
                    "PREPROCESS_ADAPTIVE_BLOCK_SIZE",
                    defaults.adaptive_block_size,
                ),
                adaptive_c: parse_env_or("PREPROCESS_ADAPTIVE_C", defaults.adaptive_c),
                deskew_correction: parse_env_or("PREPROCESS_DESKEW", defaults.deskew_correction),
                deskew_angle_limit: parse_env_or(
                    "PREPROCESS_DESKEW_ANGLE_LIMIT",
                    defaults.deskew_angle_limit,
                ),
                resize: parse_env_or("PREPROCESS_RESIZE", defaults.resize),
                resize_width: parse_env_or("PREPROCESS_RESIZE_WIDTH", defaults.resize_width),
                resize_height: parse_env_or("PREPROCESS_RESIZE_HEIGHT", defaults.resize_height),
                brightness_delta: parse_env_or(
                    "PREPROCESS_BRIGHTNESS_DELTA",
                    defaults.brightness_delta,
                ),
                quality_thresholds: QualityThresholds {
                    sharpness: parse_env_or("QUALITY_SHARPNESS_THRESHOLD", thresholds.sharpness),
                    contrast: parse_env_or("QUALITY_CONTRAST_THRESHOLD", thresholds.contrast),
                    brightness_min: parse_env_or(
                        "QUALITY_BRIGHTNESS_MIN",
                        thresholds.brightness_min,
                    ),
                    brightness_max: parse_env_or(
                        "QUALITY_BRIGHTNESS_MAX",
                        thresholds.brightness_max,
                    ),
                    skew_angle: parse_env_or("QUALITY_SKEW_THRESHOLD", thresholds.skew_angle),
                },
            },
            performance: PerformanceConfig {
                worker_pool_size: parse_env_or("WORKER_POOL_SIZE", 4),
                queue_size: parse_env_or("WORKER_QUEUE_SIZE", 100),
                cache_enabled: parse_env_or("CACHE_ENABLED", true),
                cache_size: parse_env_or("CACHE_SIZE", 100),
                cache_ttl_secs: parse_env_or("CACHE_TTL", 3600),
                cache_sweep_interval_secs: parse_env_or("CACHE_SWEEP_INTERVAL", 60),
            },
            logging: LoggingConfig {
                level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: parse_env_or("LOG_FORMAT", LogFormat::Console),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ocr.language.trim().is_empty() {
            return Err(ScribeError::Config("OCR language cannot be empty".into()));
        }
        if self.ocr.max_image_size == 0 {
            return Err(ScribeError::Config(
                "invalid max_image_size: must be positive".into(),
            ));
        }
        if self.ocr.timeout_secs == 0 {
            return Err(ScribeError::Config("invalid timeout: must be positive".into()));
        }
        if self.ocr.engine_pool_size == 0 {
            return Err(ScribeError::Config(
                "invalid engine_pool_size: must be positive".into(),
            ));
        }
        if self.performance.worker_pool_size == 0 {
            return Err(ScribeError::Config(
                "invalid worker_pool_size: must be positive".into(),
            ));
        }
        if self.performance.queue_size == 0 {
            return Err(ScribeError::Config("invalid queue_size: must be positive".into()));
        }
        if self.performance.cache_enabled && self.performance.cache_size == 0 {
            return Err(ScribeError::Config(
                "invalid cache_size: must be positive when the cache is enabled".into(),
            ));
        }
        if self.performance.cache_sweep_interval_secs == 0 {
            return Err(ScribeError::Config(
                "invalid cache_sweep_interval: must be positive".into(),
            ));
        }

        let pre = &self.preprocessing;
        if pre.binarization_mode == BinarizationMode::Adaptive
            && (pre.adaptive_block_size < 3 || pre.adaptive_block_size % 2 == 0)
        {
            return Err(ScribeError::Config(format!(
                "invalid adaptive_block_size {}: must be odd and at least 3",
                pre.adaptive_block_size
            )));
        }
        let thresholds = &pre.quality_thresholds;
        if thresholds.brightness_min >= thresholds.brightness_max {
            return Err(ScribeError::Config(format!(
                "brightness_min ({}) must be below brightness_max ({})",
                thresholds.brightness_min, thresholds.brightness_max
            )));
        }
        if pre.deskew_angle_limit <= 0.0 || pre.deskew_angle_limit > 45.0 {
            return Err(ScribeError::Config(format!(
                "invalid deskew_angle_limit {}: must be within (0, 45]",
                pre.deskew_angle_limit
            )));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ScribeError::Config(format!(
                "invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_are_valid() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::remove_var("OCR_TIMEOUT");
        std::env::remove_var("WORKER_POOL_SIZE");

        let config = Config::default();
        assert_eq!(config.ocr.timeout_secs, 30);
        assert_eq!(config.performance.worker_pool_size, 4);
        assert_eq!(config.performance.queue_size, 100);
        assert_eq!(config.ocr.max_image_size, 10 * 1024 * 1024);
        assert_eq!(
            config.preprocessing.binarization_mode,
            BinarizationMode::Otsu
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_settings_from_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::set_var("WORKER_POOL_SIZE", "8");
        std::env::set_var("WORKER_QUEUE_SIZE", "16");

        let config = Config::default();
        assert_eq!(config.performance.worker_pool_size, 8);
        assert_eq!(config.performance.queue_size, 16);

        std::env::remove_var("WORKER_POOL_SIZE");
        std::env::remove_var("WORKER_QUEUE_SIZE");
    }

    #[test]
    fn test_invalid_env_value_falls_back_to_default() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::set_var("CACHE_TTL", "forever");

        let config = Config::default();
        assert_eq!(config.performance.cache_ttl_secs, 3600);

        std::env::remove_var("CACHE_TTL");
    }

    #[test]
    fn test_binarization_mode_from_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::set_var("PREPROCESS_BINARIZATION_MODE", "Adaptive");

        let config = Config::default();
        assert_eq!(
            config.preprocessing.binarization_mode,
            BinarizationMode::Adaptive
        );

        std::env::remove_var("PREPROCESS_BINARIZATION_MODE");
    }

    #[test]
    fn test_supported_languages_list() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::set_var("OCR_SUPPORTED_LANGUAGES", "eng, deu ,,fra");

        let config = Config::default();
        assert_eq!(config.ocr.supported_languages, vec!["eng", "deu", "fra"]);

        std::env::remove_var("OCR_SUPPORTED_LANGUAGES");
    }

    #[test]
    fn test_supported_languages_unset_defers_to_engine() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::remove_var("OCR_SUPPORTED_LANGUAGES");

        let config = Config::default();
        assert!(config.ocr.supported_languages.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        let mut config = Config::default();
        config.performance.worker_pool_size = 0;
        assert!(matches!(config.validate(), Err(ScribeError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_even_adaptive_block() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        let mut config = Config::default();
        config.preprocessing.binarization_mode = BinarizationMode::Adaptive;
        config.preprocessing.adaptive_block_size = 10;
        assert!(config.validate().is_err());

        config.preprocessing.adaptive_block_size = 11;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_allows_zero_cache_size_when_disabled() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        let mut config = Config::default();
        config.performance.cache_size = 0;
        assert!(config.validate().is_err());

        config.performance.cache_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_parsing() {
        assert_eq!("STDIO".parse::<Transport>().unwrap(), Transport::Stdio);
        assert_eq!("http".parse::<Transport>().unwrap(), Transport::Http);
        assert!("grpc".parse::<Transport>().is_err());
    }

    #[test]
    fn test_log_format_from_env_accepts_aliases() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        std::env::set_var("LOG_FORMAT", "Pretty");
        assert_eq!(Config::default().logging.format, LogFormat::Console);

        std::env::set_var("LOG_FORMAT", "JSON");
        assert_eq!(Config::default().logging.format, LogFormat::Json);

        std::env::remove_var("LOG_FORMAT");
    }
}
