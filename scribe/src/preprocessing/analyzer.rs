use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::{laplacian_filter, median_filter};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use serde::Serialize;

use super::step::PipelineStep;
use crate::config::QualityThresholds;

/// Fewer near-horizontal lines than this and the skew estimate is unreliable.
const MIN_SKEW_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QualityMetrics {
    /// Variance of the Laplacian. Low values mean blur or heavy noise.
    pub sharpness: f64,
    /// Standard deviation of intensity.
    pub contrast: f64,
    /// Mean intensity, 0-255.
    pub brightness: f64,
    /// Mean absolute difference from a 3x3 median-filtered copy.
    pub noise: f64,
    /// Median angle of near-horizontal lines, in degrees.
    pub skew_angle: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageQuality {
    #[serde(flatten)]
    pub metrics: QualityMetrics,
    pub needs_preprocessing: bool,
    pub suggested_steps: Vec<PipelineStep>,
}

/// Measures an image and proposes the preprocessing steps it needs.
#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    thresholds: QualityThresholds,
    deskew_angle_limit: f64,
    detect_skew: bool,
}

impl QualityAnalyzer {
    pub fn new(thresholds: QualityThresholds, deskew_angle_limit: f64) -> Self {
        Self {
            thresholds,
            deskew_angle_limit,
            detect_skew: true,
        }
    }

    pub fn with_skew_detection(mut self, enabled: bool) -> Self {
        self.detect_skew = enabled;
        self
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn analyze(&self, gray: &GrayImage) -> ImageQuality {
        let (brightness, contrast) = mean_and_std_dev(gray);
        let metrics = QualityMetrics {
            sharpness: laplacian_variance(gray),
            contrast,
            brightness,
            noise: noise_level(gray),
            skew_angle: if self.detect_skew {
                detect_skew_angle(gray)
            } else {
                0.0
            },
        };

        let suggested_steps = decide_steps(&metrics, &self.thresholds, self.deskew_angle_limit);
        let needs_preprocessing = needs_preprocessing(&metrics, &self.thresholds)
            || suggested_steps.iter().any(PipelineStep::is_deskew);

        tracing::debug!(
            sharpness = metrics.sharpness,
            contrast = metrics.contrast,
            brightness = metrics.brightness,
            noise = metrics.noise,
            skew_angle = metrics.skew_angle,
            needs_preprocessing,
            "Analyzed image quality"
        );

        ImageQuality {
            metrics,
            needs_preprocessing,
            suggested_steps,
        }
    }
}

fn needs_preprocessing(metrics: &QualityMetrics, thresholds: &QualityThresholds) -> bool {
    metrics.sharpness < thresholds.sharpness
        || metrics.contrast < thresholds.contrast
        || metrics.brightness < thresholds.brightness_min
        || metrics.brightness > thresholds.brightness_max
}

/// Ordered steps for adaptive preprocessing.
///
/// Grayscale always leads and binarization always runs. Brightness correction,
/// contrast enhancement and denoising are added when the matching metric falls
/// outside its threshold. Deskew is added only when the skew exceeds the
/// threshold without exceeding `deskew_angle_limit`.
pub fn decide_steps(
    metrics: &QualityMetrics,
    thresholds: &QualityThresholds,
    deskew_angle_limit: f64,
) -> Vec<PipelineStep> {
    let mut steps = vec![PipelineStep::Grayscale];

    if metrics.brightness < thresholds.brightness_min {
        steps.push(PipelineStep::Brighten);
    } else if metrics.brightness > thresholds.brightness_max {
        steps.push(PipelineStep::Darken);
    }

    if metrics.contrast < thresholds.contrast {
        steps.push(PipelineStep::ContrastEnhance);
    }

    if metrics.sharpness < thresholds.sharpness {
        steps.push(PipelineStep::Denoise);
    }

    steps.push(PipelineStep::Binarization);

    if skew_needs_correction(metrics.skew_angle, thresholds.skew_angle, deskew_angle_limit) {
        steps.push(PipelineStep::Deskew {
            angle: metrics.skew_angle,
        });
    }

    steps
}

/// Whether a skew of `angle` degrees should be rotated away.
pub fn skew_needs_correction(angle: f64, min_angle: f64, max_angle: f64) -> bool {
    let magnitude = angle.abs();
    magnitude > min_angle && magnitude <= max_angle
}

fn mean_and_std_dev(gray: &GrayImage) -> (f64, f64) {
    let count = gray.width() as f64 * gray.height() as f64;
    if count == 0.0 {
        return (0.0, 0.0);
    }

    let (sum, sum_sq) = gray.pixels().fold((0.0f64, 0.0f64), |(sum, sum_sq), p| {
        let v = p[0] as f64;
        (sum + v, sum_sq + v * v)
    });
    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian, edges replicated.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    if gray.width() == 0 || gray.height() == 0 {
        return 0.0;
    }

    let laplacian = laplacian_filter(gray);
    let (sum, sum_sq) = laplacian.pixels().fold((0.0f64, 0.0f64), |(sum, sum_sq), p| {
        let v = p[0] as f64;
        (sum + v, sum_sq + v * v)
    });

    let count = gray.width() as f64 * gray.height() as f64;
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

fn noise_level(gray: &GrayImage) -> f64 {
    if gray.width() == 0 || gray.height() == 0 {
        return 0.0;
    }

    let smoothed = median_filter(gray, 1, 1);
    let total: f64 = gray
        .pixels()
        .zip(smoothed.pixels())
        .map(|(a, b)| (a[0] as f64 - b[0] as f64).abs())
        .sum();
    total / (gray.width() as f64 * gray.height() as f64)
}

/// Estimate document skew in degrees.
///
/// Runs Canny edge detection, votes lines with a Hough transform and returns the
/// median angle of the lines within 45 degrees of horizontal. Positive angles
/// mean the text slopes down to the right. Returns 0 when too few lines are
/// found.
pub fn detect_skew_angle(gray: &GrayImage) -> f64 {
    if gray.width() < 3 || gray.height() < 3 {
        return 0.0;
    }

    let edges = canny(gray, 50.0, 150.0);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: 100,
            suppression_radius: 8,
        },
    );
    if lines.len() < MIN_SKEW_LINES {
        return 0.0;
    }

    // A horizontal line has its normal at 90 degrees.
    let angles: Vec<f64> = lines
        .iter()
        .map(|line| line.angle_in_degrees as f64 - 90.0)
        .filter(|angle| angle.abs() < 45.0)
        .collect();

    median(&angles).unwrap_or(0.0)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
