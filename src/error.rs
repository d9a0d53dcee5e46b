//! Error kinds shared by the access-control core and the storage layer.

use thiserror::Error;

/// Failures raised by the Sled-backed storage.
///
/// Lookups report a missing row as `Ok(None)`, so every variant here is a
/// genuine failure rather than a not-found signal.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("email already registered")]
    EmailTaken,
}

/// Failures of the credential, token and ownership checks.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown email and wrong password are reported identically.
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email already exists")]
    EmailAlreadyExists,
    #[error("token is invalid")]
    TokenInvalid,
    #[error("token has expired")]
    TokenExpired,
    #[error("authorization header must be `Bearer <token>`")]
    MissingBearer,
    #[error("resource not found")]
    ResourceNotFound,
    #[error("user is not the owner of this resource")]
    NotOwner,
    #[error("secret exceeds {limit} bytes")]
    SecretTooLong { limit: usize },
    #[error("owner lookup timed out")]
    LookupTimedOut,
    #[error("password hashing failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),
    #[error("token encoding failed: {0}")]
    Encoding(#[source] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// True for the kinds a client may legitimately trigger; everything else
    /// is a server-side failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            AuthError::Hashing(_)
                | AuthError::Encoding(_)
                | AuthError::Storage(_)
                | AuthError::LookupTimedOut
        )
    }
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT secret must not be empty")]
    EmptySecret,
    #[error("access token lifetime must be at least one hour, got {0}")]
    AccessTtl(i64),
}
