use service_core::error::AppError;
use thiserror::Error;

/// Client-facing authentication failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token has expired")]
    Expired,

    /// Bad signature, malformed token, or a token of the wrong type.
    #[error("Invalid token")]
    InvalidSignature,

    #[error("Token has been revoked")]
    Revoked,

    #[error("Missing credential")]
    MissingCredential,

    /// The JWKS endpoint could not be reached to verify the token.
    #[error("Verification keys unavailable")]
    KeySourceUnavailable,
}

impl AuthError {
    pub fn detail(&self) -> &'static str {
        match self {
            AuthError::Expired => "Token has expired.",
            AuthError::InvalidSignature => "Could not validate credentials.",
            AuthError::Revoked => "Token has been revoked.",
            AuthError::MissingCredential => "Authorization header is missing",
            AuthError::KeySourceUnavailable => "Service unavailable",
        }
    }
}

/// Infrastructure fault in the shared store. Never shown to clients; every
/// caller resolves it into its own fail-open or fail-closed policy.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0}ms")]
    Timeout(u64),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum JwksError {
    #[error("Failed to fetch JWKS: {0}")]
    Fetch(String),

    #[error("No JWKS key with kid {0}")]
    UnknownKey(String),
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to sign token: {0}")]
    Signing(anyhow::Error),
}

/// Encryption failures. Variants stay distinct for logs; they all collapse
/// into the same opaque response.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Unknown encryption key: {0}")]
    UnknownEncryptionKey(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Ciphertext failed authentication")]
    EncryptionAuthenticationFailed,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Key store revision moved from {expected} to {found} during rotation")]
    RotationConflict { expected: u64, found: u64 },
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::KeyStore(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::KeySourceUnavailable => AppError::ServiceUnavailable,
            other => AppError::Unauthorized(other.detail().to_string()),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Auth(e) => e.into(),
            TokenError::Store(e) => {
                tracing::error!(error = %e, "Revocation store unavailable");
                AppError::ServiceUnavailable
            }
            TokenError::Signing(e) => AppError::InternalError(e),
        }
    }
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        tracing::error!(error = %err, "Encryption operation failed");
        AppError::InternalError(anyhow::anyhow!("encryption operation failed"))
    }
}
