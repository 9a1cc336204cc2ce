use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ScribeError;
use crate::ocr::RecognizeResult;

/// Options shared by every recognition entry point.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecognitionRequest {
    /// Overrides the configured default language.
    pub language: Option<String>,
    pub preprocess: bool,
    /// Adaptive step selection when true, switch-driven when false.
    pub auto_mode: bool,
}

impl Default for RecognitionRequest {
    fn default() -> Self {
        Self {
            language: None,
            preprocess: true,
            auto_mode: true,
        }
    }
}

/// A recognition outcome, shared with the cache.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub result: Arc<RecognizeResult>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResponse {
    pub text: String,
    pub confidence: f64,
    pub language: String,
    pub duration_ms: u64,
    pub cached: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl From<&Recognition> for RecognitionResponse {
    fn from(recognition: &Recognition) -> Self {
        let result = &recognition.result;
        Self {
            text: result.text.clone(),
            confidence: result.confidence,
            language: result.language.clone(),
            duration_ms: result.duration.as_millis() as u64,
            cached: recognition.cached,
            metadata: result.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Success {
        text: String,
        confidence: f64,
        language: String,
        duration_ms: u64,
        cached: bool,
    },
    Failure {
        error: String,
        code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub path: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

impl BatchItem {
    pub fn success(path: String, recognition: &Recognition) -> Self {
        let result = &recognition.result;
        Self {
            path,
            outcome: BatchOutcome::Success {
                text: result.text.clone(),
                confidence: result.confidence,
                language: result.language.clone(),
                duration_ms: result.duration.as_millis() as u64,
                cached: recognition.cached,
            },
        }
    }

    pub fn failure(path: String, error: &ScribeError) -> Self {
        Self {
            path,
            outcome: BatchOutcome::Failure {
                error: error.to_string(),
                code: error.code().to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItem>,
    pub count: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchResponse {
    pub fn new(results: Vec<BatchItem>) -> Self {
        let succeeded = results.iter().filter(|item| item.is_success()).count();
        Self {
            count: results.len(),
            failed: results.len() - succeeded,
            succeeded,
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
    pub default_language: String,
}
