use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgb};
use imageproc::contrast::{equalize_histogram, otsu_level, threshold, ThresholdType};
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::integral_image::{integral_image, sum_image_pixels};

use super::step::PipelineStep;
use crate::config::{BinarizationMode, PreprocessingConfig};
use crate::error::{Result, ScribeError};

/// Applies one pipeline step to an image.
pub trait TransformBackend: Send + Sync {
    fn apply(&self, step: PipelineStep, image: DynamicImage) -> Result<DynamicImage>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinarizationMethod {
    Otsu,
    /// Local mean over a `block_size` square, minus `c`.
    Adaptive { block_size: u32, c: f64 },
}

/// Transform backend built on `image` and `imageproc`.
#[derive(Debug, Clone)]
pub struct ImageTransforms {
    pub brightness_delta: i32,
    /// Median filter kernel size.
    pub denoise_strength: u32,
    pub binarization: BinarizationMethod,
    pub resize_width: u32,
    pub resize_height: u32,
}

impl Default for ImageTransforms {
    fn default() -> Self {
        Self::from_config(&PreprocessingConfig::default())
    }
}

impl ImageTransforms {
    pub fn from_config(config: &PreprocessingConfig) -> Self {
        let binarization = match config.binarization_mode {
            BinarizationMode::Otsu => BinarizationMethod::Otsu,
            BinarizationMode::Adaptive => BinarizationMethod::Adaptive {
                block_size: config.adaptive_block_size,
                c: config.adaptive_c,
            },
        };

        Self {
            brightness_delta: config.brightness_delta,
            denoise_strength: config.denoise_strength,
            binarization,
            resize_width: config.resize_width,
            resize_height: config.resize_height,
        }
    }

    fn denoise(&self, image: DynamicImage) -> DynamicImage {
        // Even kernel sizes round up to the next odd one.
        let radius = (self.denoise_strength.max(1) | 1) / 2;
        if radius == 0 {
            return image;
        }

        match image {
            DynamicImage::ImageLuma8(gray) => {
                DynamicImage::ImageLuma8(median_filter(&gray, radius, radius))
            }
            other => DynamicImage::ImageRgb8(median_filter(&other.to_rgb8(), radius, radius)),
        }
    }

    fn binarize(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let gray = image.to_luma8();
        let binary = match self.binarization {
            BinarizationMethod::Otsu => {
                let level = otsu_level(&gray);
                threshold(&gray, level, ThresholdType::Binary)
            }
            BinarizationMethod::Adaptive { block_size, c } => {
                if block_size < 3 || block_size % 2 == 0 {
                    return Err(ScribeError::Preprocessing {
                        step: PipelineStep::Binarization.name().to_string(),
                        message: format!("block size {block_size} must be odd and at least 3"),
                    });
                }
                adaptive_mean_threshold(&gray, block_size, c)
            }
        };
        Ok(DynamicImage::ImageLuma8(binary))
    }

    fn deskew(&self, image: DynamicImage, angle: f64) -> DynamicImage {
        if angle == 0.0 {
            return image;
        }

        tracing::debug!(angle, "Correcting skew");
        // Rotate against the detected slope.
        let theta = -(angle as f32).to_radians();
        match image {
            DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(rotate_about_center(
                &gray,
                theta,
                Interpolation::Bilinear,
                Luma([255]),
            )),
            other => DynamicImage::ImageRgb8(rotate_about_center(
                &other.to_rgb8(),
                theta,
                Interpolation::Bilinear,
                Rgb([255, 255, 255]),
            )),
        }
    }

    fn resize(&self, image: DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let (target_w, target_h) = match (self.resize_width, self.resize_height) {
            (0, 0) => return image,
            (w, 0) => (w, scale(height, w, width)),
            (0, h) => (scale(width, h, height), h),
            (w, h) => (w, h),
        };

        if (target_w, target_h) == (width, height) || target_w == 0 || target_h == 0 {
            return image;
        }
        image.resize_exact(target_w, target_h, FilterType::Triangle)
    }
}

/// `value * numerator / denominator`, rounded.
fn scale(value: u32, numerator: u32, denominator: u32) -> u32 {
    (value as f64 * numerator as f64 / denominator as f64).round() as u32
}

impl TransformBackend for ImageTransforms {
    fn apply(&self, step: PipelineStep, image: DynamicImage) -> Result<DynamicImage> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ScribeError::Preprocessing {
                step: step.name().to_string(),
                message: "image has zero width or height".to_string(),
            });
        }

        let output = match step {
            PipelineStep::Grayscale => DynamicImage::ImageLuma8(image.to_luma8()),
            PipelineStep::Brighten => image.brighten(self.brightness_delta),
            PipelineStep::Darken => image.brighten(-self.brightness_delta),
            PipelineStep::ContrastEnhance => {
                DynamicImage::ImageLuma8(equalize_histogram(&image.to_luma8()))
            }
            PipelineStep::Denoise => self.denoise(image),
            PipelineStep::Binarization => self.binarize(&image)?,
            PipelineStep::Deskew { angle } => self.deskew(image, angle),
            PipelineStep::Resize => self.resize(image),
        };
        Ok(output)
    }
}

/// Mean adaptive threshold: a pixel is white when it is brighter than the mean
/// of its `block_size` window minus `c`. The window is clipped at the border.
fn adaptive_mean_threshold(gray: &GrayImage, block_size: u32, c: f64) -> GrayImage {
    let (width, height) = gray.dimensions();
    let integral = integral_image::<_, u64>(gray);
    let half = block_size / 2;

    GrayImage::from_fn(width, height, |x, y| {
        let left = x.saturating_sub(half);
        let top = y.saturating_sub(half);
        let right = (x + half).min(width - 1);
        let bottom = (y + half).min(height - 1);

        let [sum] = sum_image_pixels(&integral, left, top, right, bottom);
        let area = ((right - left + 1) * (bottom - top + 1)) as f64;
        let level = sum as f64 / area - c;

        if gray.get_pixel(x, y)[0] as f64 > level {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
