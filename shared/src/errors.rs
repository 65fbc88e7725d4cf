/// Unified error types for JM Bot.
use thiserror::Error;

/// Top-level error type for the bot process.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while talking to the OneBot gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway not connected")]
    NotConnected,

    #[error("Failed to connect to gateway: {0}")]
    ConnectFailed(String),

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("No response within {0}s")]
    Timeout(u64),

    #[error("Gateway rejected the call (retcode {retcode}): {message}")]
    Rejected { retcode: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the call may succeed if repeated (the frame never got a verdict).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectFailed(_)
                | GatewayError::SendFailed(_)
                | GatewayError::ConnectionClosed
                | GatewayError::Timeout(_)
        )
    }
}

/// Errors raised by the external content fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to spawn fetcher: {0}")]
    SpawnFailed(String),

    #[error("Fetcher exited with code {code:?}: {detail}")]
    Exited { code: Option<i32>, detail: String },

    #[error("Fetcher IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that terminate a fetch job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("No content produced")]
    NoContent,

    #[error("Document conversion failed: {0}")]
    Document(String),

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("Encryption verification failed: {0}")]
    VerificationFailed(String),

    #[error("Artifact is {size} bytes, limit is {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("Upload rejected by gateway: {0}")]
    UploadRejected(String),

    #[error("Upload transport failure: {0}")]
    UploadTransport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Short chat reply describing this failure to the group.
    pub fn user_message(&self, content_id: &str) -> String {
        match self {
            JobError::Fetch(_) | JobError::Io(_) => {
                format!("下载JM{}失败，请稍后重试。", content_id)
            }
            JobError::NoContent => format!("下载JM{}失败：找不到下载内容。", content_id),
            JobError::Document(_) => format!("发送JM{}失败：PDF生成失败。", content_id),
            JobError::Archive(_) | JobError::VerificationFailed(_) => {
                format!("打包JM{}失败。", content_id)
            }
            JobError::SizeExceeded { limit, .. } => format!(
                "抱歉，文件大小超过限制（{}MB），无法发送。",
                *limit as f64 / 1024.0 / 1024.0
            ),
            JobError::UploadRejected(_) | JobError::UploadTransport(_) => {
                format!("JM{}上传失败：上传请求失败。", content_id)
            }
        }
    }

    /// Whether the job got far enough to attempt the upload.
    pub fn reached_upload(&self) -> bool {
        matches!(self, JobError::UploadRejected(_) | JobError::UploadTransport(_))
    }
}

/// Result type alias for bot operations.
pub type BotResult<T> = Result<T, BotError>;
