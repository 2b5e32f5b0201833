use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MdsError>;

/// The kind of an [MdsError], for callers that want to branch on the
/// failure class rather than its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    Access,
    MalformedEnvelope,
    ChainVerification,
    RevokedCertificate,
    SignatureVerification,
    Setting,
    StaleData,
    Parse,
    Json,
}

#[derive(Debug, Error)]
pub enum MdsError {
    /// A required argument was empty or missing.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A network or file access failed.
    #[error("access error: {0}")]
    Access(String),
    /// The signed envelope is not three non-empty `.` separated segments.
    #[error("Blob JWT is wrong format.")]
    MalformedEnvelope,
    /// A certificate could not be parsed, or a link in the chain did not validate.
    #[error("Certificate chain cannot be verified: {0}")]
    ChainVerification(String),
    /// A certificate in the chain is listed by one of the fetched revocation lists.
    #[error("Revoked certificate is included: serial {serial}")]
    RevokedCertificate { serial: String },
    #[error("JWS cannot be verified.")]
    SignatureVerification,
    /// The configuration required for the selected access mode is missing or invalid.
    #[error("setting error: {0}")]
    Setting(String),
    /// The metadata is past its next update date and the caller asked not to refresh.
    #[error("Metadata is old. Update at {}", .next_update.map(|d| d.to_string()).unwrap_or_else(|| "<never loaded>".to_string()))]
    StaleData { next_update: Option<NaiveDate> },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MdsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MdsError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            MdsError::Access(_) => ErrorKind::Access,
            MdsError::MalformedEnvelope => ErrorKind::MalformedEnvelope,
            MdsError::ChainVerification(_) => ErrorKind::ChainVerification,
            MdsError::RevokedCertificate { .. } => ErrorKind::RevokedCertificate,
            MdsError::SignatureVerification => ErrorKind::SignatureVerification,
            MdsError::Setting(_) => ErrorKind::Setting,
            MdsError::StaleData { .. } => ErrorKind::StaleData,
            MdsError::Parse(_) => ErrorKind::Parse,
            MdsError::Json(_) => ErrorKind::Json,
        }
    }
}

impl From<std::io::Error> for MdsError {
    fn from(v: std::io::Error) -> Self {
        Self::Access(v.to_string())
    }
}
