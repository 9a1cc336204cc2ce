use std::fmt;

use serde::{Deserialize, Serialize};

/// A single image transform in a preprocessing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Grayscale,
    Brighten,
    Darken,
    ContrastEnhance,
    Denoise,
    Binarization,
    /// Rotate by `-angle` degrees to undo a measured skew.
    Deskew { angle: f64 },
    Resize,
}

impl PipelineStep {
    pub fn name(self) -> &'static str {
        match self {
            PipelineStep::Grayscale => "grayscale",
            PipelineStep::Brighten => "brighten",
            PipelineStep::Darken => "darken",
            PipelineStep::ContrastEnhance => "contrast_enhance",
            PipelineStep::Denoise => "denoise",
            PipelineStep::Binarization => "binarization",
            PipelineStep::Deskew { .. } => "deskew",
            PipelineStep::Resize => "resize",
        }
    }

    pub fn is_deskew(&self) -> bool {
        matches!(self, PipelineStep::Deskew { .. })
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStep::Deskew { angle } => write!(f, "deskew[{angle:.2}]"),
            other => f.write_str(other.name()),
        }
    }
}

/// Join steps as `grayscale,binarization,deskew[1.50]`.
pub fn describe_steps(steps: &[PipelineStep]) -> String {
    steps
        .iter()
        .map(PipelineStep::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
