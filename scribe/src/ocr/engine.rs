use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScribeError};

/// Engine initialization parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub language: String,
    pub data_path: Option<String>,
    pub page_seg_mode: Option<u32>,
    pub whitelist: Option<String>,
    pub supported_languages: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            data_path: None,
            page_seg_mode: Some(3),
            whitelist: None,
            supported_languages: Vec::new(),
        }
    }
}

impl From<&crate::config::OcrConfig> for EngineConfig {
    fn from(config: &crate::config::OcrConfig) -> Self {
        Self {
            language: config.language.clone(),
            data_path: config.data_path.clone(),
            page_seg_mode: config.page_seg_mode,
            whitelist: config.whitelist.clone(),
            supported_languages: config.supported_languages.clone(),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RecognizeOptions {
    pub language: Option<String>,
    pub page_seg_mode: Option<u32>,
    pub preprocess: bool,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizeResult {
    pub text: String,
    /// Mean word confidence in `0..=100`.
    pub confidence: f64,
    pub language: String,
    pub duration: Duration,
    pub metadata: BTreeMap<String, String>,
}

/// A single recognition engine instance.
///
/// Implementations are stateful and not safe for concurrent use; the
/// [`EnginePool`](super::EnginePool) hands each instance to one caller at a time.
/// `recognize` blocks and is run on the blocking thread pool.
pub trait OcrEngine: Send {
    fn recognize(
        &mut self,
        image: &[u8],
        options: &RecognizeOptions,
        cancel: &CancellationToken,
    ) -> Result<RecognizeResult>;

    fn close(&mut self) -> Result<()>;

    fn supported_languages(&self) -> Vec<String>;
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn OcrEngine>>;
}

/// Check a `+`-joined language string such as `eng+chi_sim` against the known set.
///
/// An empty `supported` list accepts anything.
pub fn validate_language(language: &str, supported: &[String]) -> Result<()> {
    let language = language.trim();
    if language.is_empty() {
        return Err(ScribeError::InvalidInput("language cannot be empty".into()));
    }
    if supported.is_empty() {
        return Ok(());
    }

    for part in language.split('+') {
        if !supported.iter().any(|known| known == part) {
            return Err(ScribeError::InvalidInput(format!(
                "unsupported language '{part}', supported: {}",
                supported.join(", ")
            )));
        }
    }
    Ok(())
}
