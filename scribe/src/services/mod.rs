mod recognition;

pub use recognition::{RecognitionService, ServiceStats};
