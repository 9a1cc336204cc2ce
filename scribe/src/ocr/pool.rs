use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EngineConfig, EngineFactory, OcrEngine, RecognizeOptions, RecognizeResult};
use crate::error::{Result, ScribeError};

struct PoolInner {
    idle: Mutex<Vec<Box<dyn OcrEngine>>>,
    capacity: usize,
    factory: Arc<dyn EngineFactory>,
    config: EngineConfig,
    closed: AtomicBool,
    in_use: AtomicUsize,
}

impl PoolInner {
    fn release(&self, mut engine: Box<dyn OcrEngine>) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);

        if !self.closed.load(Ordering::SeqCst) {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.capacity {
                idle.push(engine);
                return;
            }
        }

        debug!("Closing surplus OCR engine");
        if let Err(e) = engine.close() {
            warn!(error = %e, "Failed to close OCR engine");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnginePoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub closed: bool,
}

/// Acquire/release pool of OCR engines.
///
/// Holds up to `capacity` idle engines. `get` never waits: when no engine is
/// idle a new one is built on the spot, and surplus engines are closed on
/// release.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl EnginePool {
    /// Eagerly build `size` engines. If any fails, the ones already built are
    /// closed and the error is returned.
    pub fn new(factory: Arc<dyn EngineFactory>, config: EngineConfig, size: usize) -> Result<Self> {
        let capacity = size.max(1);
        let mut engines: Vec<Box<dyn OcrEngine>> = Vec::with_capacity(capacity);

        for index in 0..capacity {
            match factory.create(&config) {
                Ok(engine) => engines.push(engine),
                Err(e) => {
                    warn!(index, error = %e, "Failed to create OCR engine, closing pool");
                    for mut engine in engines {
                        if let Err(close_err) = engine.close() {
                            warn!(error = %close_err, "Failed to close OCR engine");
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(size = capacity, language = %config.language, "OCR engine pool initialized");

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(engines),
                capacity,
                factory,
                config,
                closed: AtomicBool::new(false),
                in_use: AtomicUsize::new(0),
            }),
        })
    }

    /// Take an idle engine, or build a new one when none is idle.
    pub fn get(&self) -> Result<PooledEngine> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ScribeError::Engine("engine pool is closed".into()));
        }

        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let engine = match idle {
            Some(engine) => engine,
            None => {
                debug!("No idle OCR engine, creating overflow instance");
                self.inner.factory.create(&self.inner.config)?
            }
        };

        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledEngine {
            engine,
            pool: self.inner.clone(),
        })
    }

    /// Hand an engine back. Surplus engines, and any engine returned after
    /// `close`, are closed instead of kept.
    pub fn put(&self, engine: PooledEngine) {
        drop(engine);
    }

    /// Close every idle engine. All engines are attempted; the first error
    /// is returned. Engines still checked out are closed when released.
    pub fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let engines: Vec<_> = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut first_error = None;
        for mut engine in engines {
            if let Err(e) = engine.close() {
                warn!(error = %e, "Failed to close OCR engine");
                first_error.get_or_insert(e);
            }
        }

        info!("OCR engine pool closed");
        first_error.map_or(Ok(()), Err)
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> EnginePoolStats {
        EnginePoolStats {
            capacity: self.inner.capacity,
            idle: self.idle_count(),
            in_use: self.inner.in_use.load(Ordering::SeqCst),
            closed: self.inner.closed.load(Ordering::SeqCst),
        }
    }
}

/// Placeholder left behind once the real engine has been handed back.
struct Released;

impl OcrEngine for Released {
    fn recognize(
        &mut self,
        _image: &[u8],
        _options: &RecognizeOptions,
        _cancel: &CancellationToken,
    ) -> Result<RecognizeResult> {
        Err(ScribeError::Internal("engine already released".into()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn supported_languages(&self) -> Vec<String> {
        Vec::new()
    }
}

/// An engine checked out of an [`EnginePool`]; returned to the pool on drop.
pub struct PooledEngine {
    engine: Box<dyn OcrEngine>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledEngine {
    type Target = dyn OcrEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl DerefMut for PooledEngine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_mut()
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        let engine = std::mem::replace(&mut self.engine, Box::new(Released));
        self.pool.release(engine);
    }
}
