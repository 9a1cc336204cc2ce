//! OCR engines and the pool that shares them.
//!
//! - `OcrEngine` / `EngineFactory` define the engine seam
//! - `TesseractEngine` implements it via leptess
//! - `EnginePool` hands engines to one caller at a time
//!
//! # Usage
//!
//! ```rust,ignore
//! let pool = EnginePool::new(Arc::new(TesseractFactory), EngineConfig::from(&config.ocr), 2)?;
//! let mut engine = pool.get()?;
//! let result = engine.recognize(&png_bytes, &RecognizeOptions::default(), &cancel)?;
//! ```

mod engine;
mod pool;
mod tesseract;

pub use engine::{
    validate_language, EngineConfig, EngineFactory, OcrEngine, RecognizeOptions, RecognizeResult,
};
pub use pool::{EnginePool, EnginePoolStats, PooledEngine};
pub use tesseract::{discover_languages, resolve_languages, TesseractEngine, TesseractFactory};
