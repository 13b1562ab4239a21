//! Error types for the certificate management service.

use thiserror::Error;

/// Error taxonomy shared by the service and the client-side status manager.
///
/// Each variant is a *kind*: callers match on the variant to decide policy
/// (reject a TLS peer, retry a sweep, surface to the RPC caller) and use the
/// message only for logging.
#[derive(Debug, Error)]
pub enum CmsError {
    /// Malformed DER/PEM/PKCS#12/OCSP input. No state was mutated.
    #[error("crypto parse error: {0}")]
    CryptoParse(String),

    /// An authentication method refused the request. No record was written.
    #[error("authentication rejected: {0}")]
    AuthReject(String),

    /// Issuing would violate a live-set uniqueness invariant.
    #[error("duplicate certificate: {0}")]
    Duplicate(String),

    /// A status transition was attempted from a state outside the allowed set.
    #[error("state conflict for serial {serial}: {message}")]
    StateConflict { serial: u64, message: String },

    /// An OCSP response fell outside its validity window.
    #[error("OCSP response is stale")]
    OcspStale,

    /// Durable storage failure. Sweep tasks retry on the next tick;
    /// synchronous callers see this directly.
    #[error("store error: {0}")]
    StoreIO(#[from] rusqlite::Error),

    /// The management service could not be reached.
    #[error("certificate management service unavailable: {0}")]
    CmsUnavailable(String),

    /// Malformed or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type CmsResult<T> = Result<T, CmsError>;

impl From<openssl::error::ErrorStack> for CmsError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        CmsError::CryptoParse(e.to_string())
    }
}

impl CmsError {
    /// True for failures that a background task may retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, CmsError::StoreIO(_) | CmsError::CmsUnavailable(_))
    }

    /// Stable kind tag used on the management channel so callers can match
    /// on the class of failure without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            CmsError::CryptoParse(_) => "CryptoParse",
            CmsError::AuthReject(_) => "AuthReject",
            CmsError::Duplicate(_) => "Duplicate",
            CmsError::StateConflict { .. } => "StateConflict",
            CmsError::OcspStale => "OcspStale",
            CmsError::StoreIO(_) => "StoreIO",
            CmsError::CmsUnavailable(_) => "CmsUnavailable",
            CmsError::Config(_) => "Config",
        }
    }
}
