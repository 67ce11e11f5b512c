use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config file not found: {0}")]
    ConfigMissing(String),

    #[error("Config file malformed: {0}")]
    ConfigMalformed(String),

    #[error("Entity already exists: {0}")]
    DuplicateEntity(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("No channel available for endpoint: {0}")]
    NoChannelAvailable(String),

    #[error("Unsupported load balance strategy: {0}")]
    UnsupportedStrategy(u8),

    #[error("Converter not registered: {0}")]
    ConverterMissing(String),

    #[error("Converter already registered: {0}")]
    ConverterRegistrationConflict(String),

    #[error("Unsupported CA key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Upstream returned {status}: {body}")]
    UpstreamNon2xx { status: u16, body: String },

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Failed to write hosts file: {0}")]
    HostsWriteFailed(String),

    #[error("Trust store installation failed: {0}")]
    TrustStoreInstallFailed(String),

    #[error("Proxy server already running")]
    AlreadyRunning,

    #[error("Proxy server not running")]
    NotRunning,

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::UpstreamTransport(e.to_string())
    }
}

impl From<rcgen::Error> for AppError {
    fn from(e: rcgen::Error) -> Self {
        AppError::Certificate(e.to_string())
    }
}
