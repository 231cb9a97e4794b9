use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the entire tdnsd server
#[derive(Debug, Clone, Error)]
pub enum TdnsError {
    // IO errors
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Configuration errors
    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),
    #[error("Invalid upstream address: {0}")]
    InvalidUpstream(String),
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),
    #[error("Unknown zone option: {0}")]
    UnknownZoneOption(String),
    #[error("Invalid update policy: {0}")]
    InvalidUpdatePolicy(String),
    #[error("Include depth exceeded at {0}")]
    IncludeDepthExceeded(String),

    // Wire format errors
    #[error("Invalid DNS header")]
    InvalidHeader,
    #[error("Invalid DNS label")]
    InvalidLabel,
    #[error("Invalid question section")]
    InvalidQuestionSection,
    #[error("Invalid record section")]
    InvalidRecordSection,
    #[error("Invalid bit stream: {0}")]
    InvalidBitStream(String),

    // Zone errors
    #[error("Zone parse error: {0}")]
    ZoneParse(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Zone missing required SOA record")]
    MissingSoa,
    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    // Refresh errors
    #[error("Zone transfer failed: {0}")]
    TransferFailed(String),
    #[error("Upstream did not answer: {0}")]
    UpstreamTimeout(String),

    // Update pipeline errors. Validation, trust and policy failures
    // are response-level conditions and live in the error-response
    // catalog, not here.
    #[error("SIG(0) verification failed: {0}")]
    Sig0Verify(String),

    // DNSSEC errors
    #[error("Unsupported DNSSEC algorithm: {0}")]
    UnsupportedAlgorithm(u8),
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    // Key database errors
    #[error("Key database error: {0}")]
    KeyDb(String),
    #[error("Key database transaction already open: {0}")]
    TxAlreadyOpen(String),
    #[error("Key database path refused: {0}")]
    KeyDbPathRefused(String),

    // TLS errors
    #[error("Failed to read certificate file: {0}")]
    CertificateRead(String),
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),
    #[error("Failed to parse private key: {0}")]
    PrivateKeyParse(String),

    // Server state errors
    #[error("Server is shutting down")]
    ServerShutdown,
}

impl From<std::io::Error> for TdnsError {
    fn from(err: std::io::Error) -> Self {
        TdnsError::IoError(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TdnsError>;

/// Classification of per-zone error states. A zone in error stays
/// registered; the kind decides how queries and refreshes are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Refresh,
    Dnssec,
    Agent,
    Validation,
    Policy,
    NotReady,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config-error",
            ErrorKind::Refresh => "refresh-error",
            ErrorKind::Dnssec => "dnssec-error",
            ErrorKind::Agent => "agent-error",
            ErrorKind::Validation => "validation-error",
            ErrorKind::Policy => "policy-error",
            ErrorKind::NotReady => "not-ready",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error descriptor carried on a Zone State.
#[derive(Debug, Clone)]
pub struct ZoneErrorState {
    pub kind: ErrorKind,
    pub message: String,
    pub when: chrono::DateTime<chrono::Utc>,
}

impl ZoneErrorState {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            when: chrono::Utc::now(),
        }
    }
}
