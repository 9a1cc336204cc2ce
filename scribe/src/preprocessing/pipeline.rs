use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, ImageFormat, ImageReader};

use super::analyzer::{ImageQuality, QualityAnalyzer};
use super::selector::{AdaptiveSelector, FixedSelector, SelectionMode, StepSelector};
use super::step::{describe_steps, PipelineStep};
use super::transforms::{ImageTransforms, TransformBackend};
use crate::config::PreprocessingConfig;
use crate::error::{Result, ScribeError};

#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// PNG-encoded result.
    pub image: Vec<u8>,
    pub steps: Vec<PipelineStep>,
    pub quality: Option<ImageQuality>,
}

/// Decode, select steps, apply them in order, re-encode as PNG.
pub struct PreprocessingPipeline {
    adaptive: Box<dyn StepSelector>,
    fixed: Box<dyn StepSelector>,
    transforms: Arc<dyn TransformBackend>,
}

impl PreprocessingPipeline {
    pub fn new(
        adaptive: Box<dyn StepSelector>,
        fixed: Box<dyn StepSelector>,
        transforms: Arc<dyn TransformBackend>,
    ) -> Self {
        Self {
            adaptive,
            fixed,
            transforms,
        }
    }

    pub fn from_config(config: &PreprocessingConfig) -> Self {
        Self::with_transforms(config, Arc::new(ImageTransforms::from_config(config)))
    }

    pub fn with_transforms(
        config: &PreprocessingConfig,
        transforms: Arc<dyn TransformBackend>,
    ) -> Self {
        let analyzer = QualityAnalyzer::new(
            config.quality_thresholds.clone(),
            config.deskew_angle_limit,
        );
        Self::new(
            Box::new(AdaptiveSelector::new(analyzer)),
            Box::new(FixedSelector::from_config(config)),
            transforms,
        )
    }

    fn selector(&self, mode: SelectionMode) -> &dyn StepSelector {
        match mode {
            SelectionMode::Adaptive => self.adaptive.as_ref(),
            SelectionMode::Fixed => self.fixed.as_ref(),
        }
    }

    /// Run the pipeline over encoded image bytes.
    ///
    /// Fails with a preprocessing error naming the step that broke: `decode`,
    /// `encode`, or one of the pipeline steps. Blocking; call from
    /// `spawn_blocking` in async code.
    pub fn process(&self, bytes: &[u8], mode: SelectionMode) -> Result<PreprocessOutput> {
        let started = Instant::now();
        let image = decode(bytes)?;

        let selector = self.selector(mode);
        let selection = selector.select(&image);
        tracing::debug!(
            selector = selector.name(),
            steps = %describe_steps(&selection.steps),
            "Preprocessing pipeline"
        );

        let mut current = image;
        for step in &selection.steps {
            current = self
                .transforms
                .apply(*step, current)
                .map_err(|e| match e {
                    ScribeError::Preprocessing { .. } => e,
                    other => ScribeError::Preprocessing {
                        step: step.name().to_string(),
                        message: other.to_string(),
                    },
                })?;
        }

        let encoded = encode_png(&current)?;
        tracing::debug!(
            output_size = encoded.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image preprocessing completed"
        );

        Ok(PreprocessOutput {
            image: encoded,
            steps: selection.steps,
            quality: selection.quality,
        })
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    let failed = |message: String| ScribeError::Preprocessing {
        step: "decode".to_string(),
        message,
    };

    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| failed(format!("Failed to read image: {e}")))?
        .decode()
        .map_err(|e| failed(format!("Failed to decode image: {e}")))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
        .map_err(|e| ScribeError::Preprocessing {
            step: "encode".to_string(),
            message: format!("Failed to encode image: {e}"),
        })?;
    Ok(output)
}
