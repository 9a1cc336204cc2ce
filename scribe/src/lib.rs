//! Scribe: OCR over MCP.
//!
//! Tesseract recognition behind a bounded worker pool, a shared engine pool,
//! a TTL result cache and quality-driven image preprocessing.

pub mod cache;
pub mod config;
pub mod error;
pub mod mcp;
pub mod models;
pub mod ocr;
pub mod pool;
pub mod preprocessing;
pub mod services;
pub mod state;

pub use error::{Result, ScribeError};
