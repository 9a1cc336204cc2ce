use std::path::Path;
use std::time::Instant;

use leptess::{LepTess, Variable};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{EngineConfig, EngineFactory, OcrEngine, RecognizeOptions, RecognizeResult};
use crate::config::DEFAULT_SUPPORTED_LANGUAGES;
use crate::error::{Result, ScribeError};

fn create_tesseract(config: &EngineConfig, language: &str) -> Result<LepTess> {
    let mut tess = LepTess::new(config.data_path.as_deref(), language).map_err(|e| {
        ScribeError::Engine(format!(
            "Failed to initialize Tesseract for '{language}': {e}"
        ))
    })?;

    if let Some(whitelist) = config.whitelist.as_deref().filter(|w| !w.is_empty()) {
        tess.set_variable(Variable::TesseditCharWhitelist, whitelist)
            .map_err(|e| ScribeError::Engine(format!("Failed to set whitelist: {e}")))?;
    }

    Ok(tess)
}

/// Tesseract instance backed by leptess.
pub struct TesseractEngine {
    tess: Option<LepTess>,
    language: String,
    config: EngineConfig,
}

impl TesseractEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let tess = create_tesseract(config, &config.language)?;
        info!(language = %config.language, "Tesseract OCR initialized");

        Ok(Self {
            tess: Some(tess),
            language: config.language.clone(),
            config: config.clone(),
        })
    }

    fn tess_for(&mut self, language: &str) -> Result<&mut LepTess> {
        if self.tess.is_none() || self.language != language {
            debug!(from = %self.language, to = %language, "Reinitializing Tesseract");
            self.tess = Some(create_tesseract(&self.config, language)?);
            self.language = language.to_string();
        }
        self.tess
            .as_mut()
            .ok_or_else(|| ScribeError::Internal("Tesseract instance missing".into()))
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(
        &mut self,
        image: &[u8],
        options: &RecognizeOptions,
        cancel: &CancellationToken,
    ) -> Result<RecognizeResult> {
        if cancel.is_cancelled() {
            return Err(ScribeError::Engine("recognition cancelled".into()));
        }

        let started = Instant::now();
        let language = options
            .language
            .clone()
            .unwrap_or_else(|| self.config.language.clone());
        let page_seg_mode = options.page_seg_mode.or(self.config.page_seg_mode);

        let tess = self.tess_for(&language)?;
        if let Some(psm) = page_seg_mode {
            tess.set_variable(Variable::TesseditPagesegMode, &psm.to_string())
                .map_err(|e| ScribeError::Engine(format!("Failed to set page seg mode: {e}")))?;
        }

        tess.set_image_from_mem(image)
            .map_err(|e| ScribeError::Engine(format!("Failed to set image: {e}")))?;
        let text = tess
            .get_utf8_text()
            .map_err(|e| ScribeError::Engine(format!("Failed to extract text: {e}")))?;
        let confidence = tess.mean_text_conf().clamp(0, 100) as f64;

        Ok(RecognizeResult {
            text: text.trim().to_string(),
            confidence,
            language,
            duration: started.elapsed(),
            metadata: options.metadata.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.tess = None;
        Ok(())
    }

    fn supported_languages(&self) -> Vec<String> {
        resolve_languages(&self.config)
    }
}

/// Configured languages first, then whatever `data_path` holds, then the built-in list.
pub fn resolve_languages(config: &EngineConfig) -> Vec<String> {
    if !config.supported_languages.is_empty() {
        return config.supported_languages.clone();
    }

    let discovered = config
        .data_path
        .as_deref()
        .map(|dir| discover_languages(Path::new(dir)))
        .unwrap_or_default();
    if !discovered.is_empty() {
        debug!(count = discovered.len(), "Discovered tessdata languages");
        return discovered;
    }

    DEFAULT_SUPPORTED_LANGUAGES
        .iter()
        .map(|language| language.to_string())
        .collect()
}

/// List the languages with a `<lang>.traineddata` file in `dir`, sorted.
pub fn discover_languages(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut languages: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("traineddata") {
                return None;
            }
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .collect();
    languages.sort();
    languages
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TesseractFactory;

impl EngineFactory for TesseractFactory {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn OcrEngine>> {
        Ok(Box::new(TesseractEngine::new(config)?))
    }
}
