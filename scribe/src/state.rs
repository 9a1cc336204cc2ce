use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::ocr::EngineFactory;
use crate::services::RecognitionService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub recognition: RecognitionService,
}

impl AppState {
    pub fn new(config: Config, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let recognition = RecognitionService::new(&config, factory)?;
        Ok(Self::with_service(config, recognition))
    }

    pub fn with_service(config: Config, recognition: RecognitionService) -> Self {
        Self {
            config: Arc::new(config),
            recognition,
        }
    }
}
