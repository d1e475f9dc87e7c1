use std::fmt;

/// Core error type.
///
/// Adapter crates map their failures into this type. Admission denials are not
/// errors; they travel as [`crate::gatekeeper::Decision`] values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache store error: {0}")]
    Cache(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an upstream call (LLM, document storage, cache store).
///
/// `code` is a transport-level code such as `ECONNRESET`; `status` is an
/// HTTP-like status if the upstream speaks one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, self.status) {
            (Some(code), Some(status)) => write!(f, "{} ({code}, status {status})", self.message),
            (Some(code), None) => write!(f, "{} ({code})", self.message),
            (None, Some(status)) => write!(f, "{} (status {status})", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}
