use image::DynamicImage;

use super::analyzer::{detect_skew_angle, skew_needs_correction, ImageQuality, QualityAnalyzer};
use super::step::PipelineStep;
use crate::config::PreprocessingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Steps chosen from measured image quality.
    Adaptive,
    /// Steps taken from the configuration switches.
    Fixed,
}

impl SelectionMode {
    pub fn from_auto_mode(auto_mode: bool) -> Self {
        if auto_mode {
            SelectionMode::Adaptive
        } else {
            SelectionMode::Fixed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SelectionMode::Adaptive => "auto",
            SelectionMode::Fixed => "fixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub steps: Vec<PipelineStep>,
    pub quality: Option<ImageQuality>,
}

/// Decides which steps a pipeline run applies, in order.
pub trait StepSelector: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, image: &DynamicImage) -> Selection;
}

pub struct AdaptiveSelector {
    analyzer: QualityAnalyzer,
}

impl AdaptiveSelector {
    pub fn new(analyzer: QualityAnalyzer) -> Self {
        Self { analyzer }
    }
}

impl StepSelector for AdaptiveSelector {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select(&self, image: &DynamicImage) -> Selection {
        let quality = self.analyzer.analyze(&image.to_luma8());
        Selection {
            steps: quality.suggested_steps.clone(),
            quality: Some(quality),
        }
    }
}

/// Switch-driven selection in the order grayscale, denoise, binarization,
/// deskew, resize.
///
/// Deskew still needs a measured angle, so it is emitted only when the image's
/// skew falls inside the same correction window the adaptive rule uses.
#[derive(Debug, Clone)]
pub struct FixedSelector {
    grayscale: bool,
    denoise: bool,
    binarization: bool,
    deskew: bool,
    resize: bool,
    skew_threshold: f64,
    deskew_angle_limit: f64,
}

impl FixedSelector {
    pub fn from_config(config: &PreprocessingConfig) -> Self {
        Self {
            grayscale: config.grayscale,
            denoise: config.denoise,
            binarization: config.binarization,
            deskew: config.deskew_correction,
            resize: config.resize,
            skew_threshold: config.quality_thresholds.skew_angle,
            deskew_angle_limit: config.deskew_angle_limit,
        }
    }

    fn steps(&self, skew_angle: Option<f64>) -> Vec<PipelineStep> {
        let deskew = skew_angle
            .filter(|angle| {
                skew_needs_correction(*angle, self.skew_threshold, self.deskew_angle_limit)
            })
            .map(|angle| PipelineStep::Deskew { angle });

        [
            self.grayscale.then_some(PipelineStep::Grayscale),
            self.denoise.then_some(PipelineStep::Denoise),
            self.binarization.then_some(PipelineStep::Binarization),
            deskew,
            self.resize.then_some(PipelineStep::Resize),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

impl StepSelector for FixedSelector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn select(&self, image: &DynamicImage) -> Selection {
        let skew_angle = self.deskew.then(|| detect_skew_angle(&image.to_luma8()));
        Selection {
            steps: self.steps(skew_angle),
            quality: None,
        }
    }
}
