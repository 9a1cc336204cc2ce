use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    transport::{
        streamable_http_server::{
            session::local::LocalSessionManager, tower::StreamableHttpService,
        },
        StreamableHttpServerConfig,
    },
    ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ScribeError;
use crate::models::{RecognitionRequest, RecognitionResponse};
use crate::state::AppState;

#[derive(Clone)]
pub struct ScribeMcpServer {
    state: AppState,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RecognizeTextArgs {
    /// Path to the image file on the server.
    image_path: String,
    /// Tesseract language, e.g. `eng` or `eng+chi_sim`.
    #[serde(default)]
    language: Option<String>,
    #[serde(default = "default_true")]
    preprocess: bool,
    /// Pick preprocessing steps from measured image quality.
    #[serde(default = "default_true")]
    auto_mode: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RecognizeBase64Args {
    /// Base64 image data, optionally as a `data:` URL.
    image_base64: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default = "default_true")]
    preprocess: bool,
    #[serde(default = "default_true")]
    auto_mode: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BatchRecognizeArgs {
    image_paths: Vec<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default = "default_true")]
    preprocess: bool,
    #[serde(default = "default_true")]
    auto_mode: bool,
}

fn default_true() -> bool {
    true
}

fn request(language: Option<String>, preprocess: bool, auto_mode: bool) -> RecognitionRequest {
    RecognitionRequest {
        language,
        preprocess,
        auto_mode,
    }
}

impl ScribeMcpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    fn as_internal_error(message: &'static str, error: impl std::fmt::Display) -> McpError {
        tracing::error!(error = %error, "{message}");
        McpError::internal_error(message, None)
    }

    fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|error| Self::as_internal_error("Failed to serialize result", error))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Domain failures are reported in-band so the caller sees the code.
    fn error_result(tool: &str, error: &ScribeError) -> CallToolResult {
        tracing::warn!(tool, code = error.code(), error = %error, "Tool call failed");
        CallToolResult::error(vec![Content::text(error.to_json().to_string())])
    }
}

#[tool_router]
impl ScribeMcpServer {
    #[tool(
        name = "ocr_recognize_text",
        description = "Recognize text in an image file. Preprocessing is adaptive by default."
    )]
    async fn recognize_text(
        &self,
        Parameters(args): Parameters<RecognizeTextArgs>,
    ) -> Result<CallToolResult, McpError> {
        let request = request(args.language, args.preprocess, args.auto_mode);
        match self
            .state
            .recognition
            .recognize_path(&args.image_path, &request)
            .await
        {
            Ok(recognition) => Self::json_result(&RecognitionResponse::from(&recognition)),
            Err(error) => Ok(Self::error_result("ocr_recognize_text", &error)),
        }
    }

    #[tool(
        name = "ocr_recognize_text_base64",
        description = "Recognize text in a base64-encoded image."
    )]
    async fn recognize_text_base64(
        &self,
        Parameters(args): Parameters<RecognizeBase64Args>,
    ) -> Result<CallToolResult, McpError> {
        let request = request(args.language, args.preprocess, args.auto_mode);
        match self
            .state
            .recognition
            .recognize_base64(&args.image_base64, &request)
            .await
        {
            Ok(recognition) => Self::json_result(&RecognitionResponse::from(&recognition)),
            Err(error) => Ok(Self::error_result("ocr_recognize_text_base64", &error)),
        }
    }

    #[tool(
        name = "ocr_batch_recognize",
        description = "Recognize text in several image files concurrently. Results keep the input order."
    )]
    async fn batch_recognize(
        &self,
        Parameters(args): Parameters<BatchRecognizeArgs>,
    ) -> Result<CallToolResult, McpError> {
        let request = request(args.language, args.preprocess, args.auto_mode);
        match self
            .state
            .recognition
            .recognize_batch(args.image_paths, &request)
            .await
        {
            Ok(batch) => Self::json_result(&batch),
            Err(error) => Ok(Self::error_result("ocr_batch_recognize", &error)),
        }
    }

    #[tool(
        name = "ocr_get_supported_languages",
        description = "List the OCR languages this server can recognize."
    )]
    async fn get_supported_languages(&self) -> Result<CallToolResult, McpError> {
        Self::json_result(&self.state.recognition.supported_languages())
    }
}

#[tool_handler]
impl ServerHandler for ScribeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.state.config.server.name.clone(),
                title: Some("Scribe OCR".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use ocr_recognize_text for files, ocr_recognize_text_base64 for inline images, \
                 and ocr_batch_recognize for several files at once."
                    .to_string(),
            ),
        }
    }
}

pub fn streamable_http_service(
    state: AppState,
) -> StreamableHttpService<ScribeMcpServer, LocalSessionManager> {
    StreamableHttpService::new(
        move || Ok(ScribeMcpServer::new(state.clone())),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    )
}
