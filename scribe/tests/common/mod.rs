#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tokio_util::sync::CancellationToken;

use scribe::config::Config;
use scribe::ocr::{EngineConfig, EngineFactory, OcrEngine, RecognizeOptions, RecognizeResult};
use scribe::preprocessing::{PipelineStep, PreprocessingPipeline, TransformBackend};
use scribe::services::RecognitionService;
use scribe::{Result, ScribeError};

/// Images this wide make the mock engine fail.
pub const FAILING_WIDTH: u32 = 13;
/// Images this wide make the mock engine sleep for `MockBehavior::slow_delay`.
pub const SLOW_WIDTH: u32 = 17;

#[derive(Default)]
pub struct EngineCounters {
    pub created: AtomicUsize,
    pub recognized: AtomicUsize,
    pub closed: AtomicUsize,
    /// Widths of successfully recognized images, in completion order.
    pub completed: Mutex<Vec<u32>>,
}

impl EngineCounters {
    pub fn recognized(&self) -> usize {
        self.recognized.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn completion_order(&self) -> Vec<u32> {
        self.completed.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct MockBehavior {
    pub slow_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            slow_delay: Duration::from_millis(1500),
        }
    }
}

/// Reports the decoded image size as its text, e.g. `40x20`.
pub struct MockEngine {
    counters: Arc<EngineCounters>,
    behavior: MockBehavior,
}

impl OcrEngine for MockEngine {
    fn recognize(
        &mut self,
        image: &[u8],
        options: &RecognizeOptions,
        _cancel: &CancellationToken,
    ) -> Result<RecognizeResult> {
        let started = Instant::now();
        self.counters.recognized.fetch_add(1, Ordering::SeqCst);

        let decoded = image::load_from_memory(image)
            .map_err(|e| ScribeError::Engine(format!("mock could not decode image: {e}")))?;
        let (width, height) = (decoded.width(), decoded.height());

        if width == FAILING_WIDTH {
            return Err(ScribeError::Engine("mock engine failure".into()));
        }
        if width == SLOW_WIDTH {
            std::thread::sleep(self.behavior.slow_delay);
        }
        self.counters.completed.lock().unwrap().push(width);

        Ok(RecognizeResult {
            text: format!("{width}x{height}"),
            confidence: 88.0,
            language: options.language.clone().unwrap_or_else(|| "eng".into()),
            duration: started.elapsed(),
            metadata: options.metadata.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["eng".to_string(), "jpn".to_string()]
    }
}

pub struct MockFactory {
    pub counters: Arc<EngineCounters>,
    pub behavior: MockBehavior,
}

impl EngineFactory for MockFactory {
    fn create(&self, _config: &EngineConfig) -> Result<Box<dyn OcrEngine>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            counters: self.counters.clone(),
            behavior: self.behavior.clone(),
        }))
    }
}

/// Pass-through transform backend that counts calls and can be told to fail.
#[derive(Default)]
pub struct CountingTransforms {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl CountingTransforms {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransformBackend for CountingTransforms {
    fn apply(&self, step: PipelineStep, image: DynamicImage) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ScribeError::Preprocessing {
                step: step.name().to_string(),
                message: "forced failure".to_string(),
            });
        }
        Ok(image)
    }
}

pub struct Harness {
    pub service: RecognitionService,
    pub engines: Arc<EngineCounters>,
    pub transforms: Arc<CountingTransforms>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ocr.language = "eng".to_string();
    config.ocr.supported_languages = vec!["eng".to_string(), "jpn".to_string()];
    config.ocr.engine_pool_size = 1;
    config.ocr.timeout_secs = 1;
    config.ocr.max_image_size = 1024 * 1024;
    config.preprocessing.enabled = true;
    config.preprocessing.grayscale = true;
    config.preprocessing.denoise = true;
    config.preprocessing.binarization = true;
    config.performance.worker_pool_size = 2;
    config.performance.queue_size = 8;
    config.performance.cache_enabled = true;
    config.performance.cache_size = 16;
    config.performance.cache_ttl_secs = 60;
    config
}

pub fn harness(config: Config) -> Harness {
    harness_with(config, MockBehavior::default(), CountingTransforms::default())
}

pub fn harness_with(
    config: Config,
    behavior: MockBehavior,
    transforms: CountingTransforms,
) -> Harness {
    let engines = Arc::new(EngineCounters::default());
    let transforms = Arc::new(transforms);
    let factory = Arc::new(MockFactory {
        counters: engines.clone(),
        behavior,
    });
    let pipeline = PreprocessingPipeline::with_transforms(&config.preprocessing, transforms.clone());
    let service = RecognitionService::with_pipeline(&config, factory, pipeline)
        .expect("Failed to build recognition service");

    Harness {
        service,
        engines,
        transforms,
    }
}

/// PNG with a simple stripe pattern so it is not trivially uniform.
pub fn make_png(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_fn(width, height, |x, _| {
        if x % 4 < 2 {
            Luma([0])
        } else {
            Luma([255])
        }
    });
    let mut output = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
        .expect("Failed to encode PNG");
    output
}

pub fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> String {
    let path = dir.join(name);
    std::fs::write(&path, make_png(width, height)).expect("Failed to write PNG fixture");
    path.to_string_lossy().into_owned()
}

pub fn metadata_value(metadata: &BTreeMap<String, String>, key: &str) -> Option<String> {
    metadata.get(key).cloned()
}
