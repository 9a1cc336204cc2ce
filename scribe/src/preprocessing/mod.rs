//! Quality-driven image preprocessing.
//!
//! An analyzer measures the decoded image, a `StepSelector` turns that into an
//! ordered list of `PipelineStep`s, and a `TransformBackend` applies them.

mod analyzer;
mod pipeline;
mod selector;
mod step;
mod transforms;

pub use analyzer::{
    decide_steps, detect_skew_angle, median, skew_needs_correction, ImageQuality,
    QualityAnalyzer, QualityMetrics,
};
pub use pipeline::{PreprocessOutput, PreprocessingPipeline};
pub use selector::{AdaptiveSelector, FixedSelector, Selection, SelectionMode, StepSelector};
pub use step::{describe_steps, PipelineStep};
pub use transforms::{BinarizationMethod, ImageTransforms, TransformBackend};
