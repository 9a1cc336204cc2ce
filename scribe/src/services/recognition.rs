use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{fingerprint, CacheStats, ResultCache};
use crate::config::Config;
use crate::error::{Result, ScribeError};
use crate::models::{
    BatchItem, BatchResponse, LanguagesResponse, Recognition, RecognitionRequest,
};
use crate::ocr::{
    validate_language, EngineConfig, EngineFactory, EnginePool, EnginePoolStats,
    RecognizeOptions, RecognizeResult,
};
use crate::pool::{BoxedTask, PoolError, Task, TaskResult, WorkerPool, WorkerPoolStats};
use crate::preprocessing::{describe_steps, PreprocessingPipeline, SelectionMode};

/// Formats the decoder and Tesseract both understand.
const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/bmp",
    "image/tiff",
    "image/webp",
];

/// Back-off between submit attempts while the worker queue is full.
const QUEUE_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub workers: WorkerPoolStats,
    pub engines: EnginePoolStats,
    pub cache: CacheStats,
    /// Batch items submitted but not yet finished.
    pub pending_batch_items: usize,
}

struct Core {
    cache: ResultCache<Arc<RecognizeResult>>,
    engines: EnginePool,
    pipeline: Arc<PreprocessingPipeline>,
    default_language: String,
    supported_languages: Vec<String>,
    max_image_size: usize,
    timeout: Duration,
    preprocessing_enabled: bool,
}

impl Core {
    async fn recognize_path(&self, path: &str, request: &RecognitionRequest) -> Result<Recognition> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ScribeError::InvalidInput("image_path cannot be empty".into()));
        }

        let not_found = || ScribeError::FileNotFound {
            path: path.to_string(),
        };
        let metadata = match tokio::fs::metadata(Path::new(path)).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(ScribeError::InvalidInput(format!("{path} is not a file")));
        }
        let size = metadata.len() as usize;
        if size > self.max_image_size {
            return Err(ScribeError::ImageTooLarge {
                size,
                limit: self.max_image_size,
            });
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        self.recognize_bytes(bytes, request).await
    }

    async fn recognize_bytes(
        &self,
        bytes: Vec<u8>,
        request: &RecognitionRequest,
    ) -> Result<Recognition> {
        let started = Instant::now();

        if bytes.is_empty() {
            return Err(ScribeError::InvalidInput("image data is empty".into()));
        }
        if bytes.len() > self.max_image_size {
            return Err(ScribeError::ImageTooLarge {
                size: bytes.len(),
                limit: self.max_image_size,
            });
        }
        check_format(&bytes)?;

        let language = request
            .language
            .as_deref()
            .map(str::trim)
            .filter(|language| !language.is_empty())
            .unwrap_or(self.default_language.as_str())
            .to_string();
        validate_language(&language, &self.supported_languages)?;

        let mode = (request.preprocess && self.preprocessing_enabled)
            .then(|| SelectionMode::from_auto_mode(request.auto_mode));
        let key = fingerprint(
            &bytes,
            &[language.as_str(), mode.map_or("none", SelectionMode::as_str)],
        );

        if let Some(result) = self.cache.get(&key) {
            debug!(key = %key, "Cache hit");
            return Ok(Recognition {
                result,
                cached: true,
            });
        }

        let original: Arc<[u8]> = bytes.into();
        let mut metadata = BTreeMap::new();
        let image = match mode {
            Some(mode) => self.preprocess(original, mode, &mut metadata).await,
            None => original,
        };

        let options = RecognizeOptions {
            language: Some(language),
            page_seg_mode: None,
            preprocess: mode.is_some(),
            metadata,
        };
        let mut result = self.run_engine(image, options).await?;
        result.duration = started.elapsed();

        let result = Arc::new(result);
        self.cache.set(key, result.clone());

        info!(
            language = %result.language,
            confidence = result.confidence,
            duration_ms = result.duration.as_millis() as u64,
            "Recognized image"
        );

        Ok(Recognition {
            result,
            cached: false,
        })
    }

    /// Best effort: any failure falls back to the original bytes.
    async fn preprocess(
        &self,
        original: Arc<[u8]>,
        mode: SelectionMode,
        metadata: &mut BTreeMap<String, String>,
    ) -> Arc<[u8]> {
        let pipeline = self.pipeline.clone();
        let input = original.clone();
        let outcome = tokio::task::spawn_blocking(move || pipeline.process(&input, mode)).await;

        let error = match outcome {
            Ok(Ok(output)) => {
                metadata.insert("preprocessing_mode".into(), mode.as_str().into());
                metadata.insert("preprocessing_steps".into(), describe_steps(&output.steps));
                return output.image.into();
            }
            Ok(Err(e)) => e,
            Err(e) => ScribeError::Internal(format!("preprocessing task panicked: {e}")),
        };

        warn!(error = %error, "Preprocessing failed, using original image");
        metadata.insert("preprocessing_fallback".into(), "true".into());
        metadata.insert("preprocessing_error".into(), error.to_string());
        original
    }

    /// Run recognition on a pooled engine under the configured timeout.
    ///
    /// On timeout the blocking call keeps its engine until it finishes; the
    /// guard then returns the engine to the pool.
    async fn run_engine(&self, image: Arc<[u8]>, options: RecognizeOptions) -> Result<RecognizeResult> {
        let engines = self.engines.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let mut engine = engines.get()?;
            engine.recognize(&image, &options, &task_cancel)
        });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ScribeError::Internal(format!("OCR task panicked: {e}"))),
            Err(_) => {
                cancel.cancel();
                warn!(timeout_ms = self.timeout.as_millis() as u64, "OCR timed out");
                Err(ScribeError::Timeout(self.timeout))
            }
        }
    }
}

fn check_format(bytes: &[u8]) -> Result<()> {
    match infer::get(bytes) {
        Some(kind) if SUPPORTED_MIME_TYPES.contains(&kind.mime_type()) => Ok(()),
        Some(kind) => Err(ScribeError::UnsupportedFormat(kind.mime_type().to_string())),
        None => Err(ScribeError::UnsupportedFormat(
            "unrecognized image data".to_string(),
        )),
    }
}

/// Strip an optional `data:<mime>;base64,` prefix and decode.
///
/// Payloads whose decoded size would exceed `max_size` are rejected before
/// decoding.
fn decode_base64(data: &str, max_size: usize) -> Result<Vec<u8>> {
    let data = data.trim();
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| ScribeError::InvalidInput("malformed data URL".into()))?,
        None => data,
    };
    if payload.is_empty() {
        return Err(ScribeError::InvalidInput("image_base64 cannot be empty".into()));
    }

    let padding = payload.bytes().rev().take_while(|b| *b == b'=').count().min(2);
    let decoded_size = (payload.len() / 4 * 3 + payload.len() % 4 * 3 / 4).saturating_sub(padding);
    if decoded_size > max_size {
        return Err(ScribeError::ImageTooLarge {
            size: decoded_size,
            limit: max_size,
        });
    }

    STANDARD
        .decode(payload)
        .map_err(|e| ScribeError::InvalidInput(format!("invalid base64 image data: {e}")))
}

struct RecognizeFileTask {
    id: String,
    path: String,
    request: RecognitionRequest,
    core: Arc<Core>,
}

#[async_trait]
impl Task for RecognizeFileTask {
    type Output = Recognition;

    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<Recognition> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(ScribeError::Internal("worker pool shutting down".into()))
            }
            result = self.core.recognize_path(&self.path, &self.request) => result,
        }
    }
}

type Pending = HashMap<String, oneshot::Sender<Result<Recognition>>>;

/// Drops a router registration unless its task reached the queue, including
/// when the batch future is dropped mid-dispatch.
struct Registration<'a> {
    router: &'a ResultRouter,
    task_id: String,
    submitted: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            self.router.forget(&self.task_id);
        }
    }
}

/// Routes worker-pool results back to the caller waiting on each task id.
#[derive(Clone, Default)]
struct ResultRouter {
    pending: Arc<Mutex<Pending>>,
}

impl ResultRouter {
    fn register(&self, task_id: &str) -> oneshot::Receiver<Result<Recognition>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), tx);
        rx
    }

    fn forget(&self, task_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn(self, mut results: mpsc::Receiver<TaskResult<Recognition>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(TaskResult {
                task_id,
                value,
                duration,
            }) = results.recv().await
            {
                debug!(task_id = %task_id, duration_ms = duration.as_millis() as u64, "Task finished");
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(value);
                    }
                    None => warn!(task_id = %task_id, "Result for unknown task"),
                }
            }
            debug!("Result router shutting down...");
        })
    }
}

/// Validates input, consults the cache, preprocesses, and runs pooled OCR.
///
/// Must be constructed inside a tokio runtime; it starts the worker pool, the
/// result router, and the cache sweeper.
#[derive(Clone)]
pub struct RecognitionService {
    core: Arc<Core>,
    workers: Arc<WorkerPool<Recognition>>,
    router: ResultRouter,
    background: CancellationToken,
}

impl RecognitionService {
    pub fn new(config: &Config, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let pipeline = PreprocessingPipeline::from_config(&config.preprocessing);
        Self::with_pipeline(config, factory, pipeline)
    }

    pub fn with_pipeline(
        config: &Config,
        factory: Arc<dyn EngineFactory>,
        pipeline: PreprocessingPipeline,
    ) -> Result<Self> {
        let engines = EnginePool::new(
            factory,
            EngineConfig::from(&config.ocr),
            config.ocr.engine_pool_size,
        )?;

        let supported_languages = if config.ocr.supported_languages.is_empty() {
            engines.get()?.supported_languages()
        } else {
            config.ocr.supported_languages.clone()
        };

        let performance = &config.performance;
        let cache = ResultCache::new(
            performance.cache_size,
            Duration::from_secs(performance.cache_ttl_secs),
            performance.cache_enabled,
        );

        let background = CancellationToken::new();
        cache.spawn_sweeper(
            Duration::from_secs(performance.cache_sweep_interval_secs.max(1)),
            background.child_token(),
        );

        let workers = Arc::new(WorkerPool::new(
            performance.worker_pool_size,
            performance.queue_size,
        ));
        let router = ResultRouter::default();
        router.clone().spawn(workers.start()?);

        info!(
            workers = performance.worker_pool_size,
            engines = config.ocr.engine_pool_size,
            cache_enabled = performance.cache_enabled,
            "Recognition service ready"
        );

        Ok(Self {
            core: Arc::new(Core {
                cache,
                engines,
                pipeline: Arc::new(pipeline),
                default_language: config.ocr.language.clone(),
                supported_languages,
                max_image_size: config.ocr.max_image_size,
                timeout: config.ocr.timeout(),
                preprocessing_enabled: config.preprocessing.enabled,
            }),
            workers,
            router,
            background,
        })
    }

    pub async fn recognize_path(
        &self,
        path: &str,
        request: &RecognitionRequest,
    ) -> Result<Recognition> {
        self.core.recognize_path(path, request).await
    }

    pub async fn recognize_base64(
        &self,
        data: &str,
        request: &RecognitionRequest,
    ) -> Result<Recognition> {
        let bytes = decode_base64(data, self.core.max_image_size)?;
        self.core.recognize_bytes(bytes, request).await
    }

    pub async fn recognize_bytes(
        &self,
        bytes: Vec<u8>,
        request: &RecognitionRequest,
    ) -> Result<Recognition> {
        self.core.recognize_bytes(bytes, request).await
    }

    /// Recognize every path through the worker pool.
    ///
    /// Results come back in input order. A failing item becomes an error entry
    /// and does not affect the others.
    pub async fn recognize_batch(
        &self,
        paths: Vec<String>,
        request: &RecognitionRequest,
    ) -> Result<BatchResponse> {
        if paths.is_empty() {
            return Err(ScribeError::InvalidInput("image_paths cannot be empty".into()));
        }

        // One submission deadline for the whole batch.
        let deadline = Instant::now() + self.core.timeout;
        let mut slots = Vec::with_capacity(paths.len());
        for path in &paths {
            let task_id = Uuid::new_v4().to_string();
            let receiver = self.router.register(&task_id);
            let mut registration = Registration {
                router: &self.router,
                task_id: task_id.clone(),
                submitted: false,
            };
            let task = Box::new(RecognizeFileTask {
                id: task_id,
                path: path.clone(),
                request: request.clone(),
                core: self.core.clone(),
            });

            match self.dispatch(task, deadline).await {
                Ok(()) => {
                    registration.submitted = true;
                    slots.push(Ok(receiver));
                }
                Err(e) => slots.push(Err(e)),
            }
        }

        let items = join_all(slots.into_iter().zip(paths).map(|(slot, path)| async move {
            let outcome = match slot {
                Ok(receiver) => receiver.await.unwrap_or_else(|_| {
                    Err(ScribeError::Internal("task result was dropped".into()))
                }),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(recognition) => BatchItem::success(path, &recognition),
                Err(e) => {
                    debug!(path = %path, code = e.code(), "Batch item failed");
                    BatchItem::failure(path, &e)
                }
            }
        }))
        .await;

        let response = BatchResponse::new(items);
        info!(
            count = response.count,
            succeeded = response.succeeded,
            failed = response.failed,
            "Batch recognition finished"
        );
        Ok(response)
    }

    /// Submit, retrying while the queue is full until `deadline`.
    async fn dispatch(&self, mut task: BoxedTask<Recognition>, deadline: Instant) -> Result<()> {
        loop {
            match self.workers.submit(task) {
                Ok(()) => return Ok(()),
                Err(rejected) if rejected.reason == PoolError::QueueFull => {
                    if Instant::now() >= deadline {
                        return Err(rejected.into());
                    }
                    task = rejected.task;
                    tokio::time::sleep(QUEUE_RETRY_DELAY).await;
                }
                Err(rejected) => return Err(rejected.into()),
            }
        }
    }

    pub fn supported_languages(&self) -> LanguagesResponse {
        LanguagesResponse {
            languages: self.core.supported_languages.clone(),
            default_language: self.core.default_language.clone(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            workers: self.workers.stats(),
            engines: self.core.engines.stats(),
            cache: self.core.cache.stats(),
            pending_batch_items: self.router.pending_count(),
        }
    }

    /// Drain the worker pool, stop background tasks, drop cached results and
    /// close the engines.
    pub async fn shutdown(&self) {
        self.workers.stop().await;
        self.background.cancel();
        self.core.cache.clear();
        if let Err(e) = self.core.engines.close() {
            warn!(error = %e, "Failed to close OCR engines cleanly");
        }
        info!("Recognition service stopped");
    }
}
