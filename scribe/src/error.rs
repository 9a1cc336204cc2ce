use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::pool::PoolError;

#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    ImageTooLarge { size: usize, limit: usize },

    #[error("Preprocessing step '{step}' failed: {message}")]
    Preprocessing { step: String, message: String },

    #[error("OCR engine error: {0}")]
    Engine(String),

    #[error("OCR operation timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScribeError {
    /// Stable machine-readable code surfaced to tool callers.
    pub fn code(&self) -> &'static str {
        match self {
            ScribeError::InvalidInput(_) => "INVALID_INPUT",
            ScribeError::FileNotFound { .. } => "FILE_NOT_FOUND",
            ScribeError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            ScribeError::ImageTooLarge { .. } => "IMAGE_TOO_LARGE",
            ScribeError::Preprocessing { .. } => "PREPROCESSING_FAILED",
            ScribeError::Engine(_) => "OCR_ENGINE_FAILED",
            ScribeError::Timeout(_) => "TIMEOUT",
            ScribeError::Pool(_)
            | ScribeError::Config(_)
            | ScribeError::Io(_)
            | ScribeError::Json(_)
            | ScribeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        match self {
            ScribeError::FileNotFound { path } => {
                details.insert("path".to_string(), json!(path));
            }
            ScribeError::ImageTooLarge { size, limit } => {
                details.insert("size".to_string(), json!(size));
                details.insert("limit".to_string(), json!(limit));
            }
            ScribeError::Preprocessing { step, .. } => {
                details.insert("step".to_string(), json!(step));
            }
            ScribeError::Timeout(timeout) => {
                details.insert("timeout_ms".to_string(), json!(timeout.as_millis() as u64));
            }
            ScribeError::Pool(e) => {
                let reason = match e {
                    PoolError::QueueFull => "queue_full",
                    PoolError::NotStarted => "not_started",
                    PoolError::AlreadyStarted => "already_started",
                };
                details.insert("pool".to_string(), json!(reason));
            }
            ScribeError::Io(e) => {
                details.insert("io_kind".to_string(), json!(format!("{:?}", e.kind())));
            }
            _ => {}
        }
        details
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScribeError::Timeout(_) | ScribeError::Pool(PoolError::QueueFull)
        )
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": self.to_string(),
            "code": self.code(),
            "details": self.details(),
        })
    }
}

pub type Result<T> = std::result::Result<T, ScribeError>;
