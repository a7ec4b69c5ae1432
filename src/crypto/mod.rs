//! End-to-End Encryption Core
//!
//! Password-derived key hierarchy for the encrypted drive:
//!
//! - The user owns an RSA-4096 keypair. The private half is stored and
//!   shipped AES-256-CTR encrypted under a PBKDF2-HMAC-SHA512 wrapper key
//!   derived from the account password.
//! - Every encrypted folder or file has a 104-byte symmetric key bundle
//!   (AES-256 key + HMAC-SHA512 key), wrapped with the user's public key
//!   and persisted only in wrapped form.
//! - Folder keys drive the filename codec, file keys the sector codec.
//!
//! Plaintext key material lives either on the stack of a single call or in
//! the [`CacheManager`](crate::keycache::CacheManager) under a short TTL,
//! and is wiped on release.

pub mod blob;
pub mod codec;
pub mod vault;

use thiserror::Error;

use crate::api::ApiError;
use crate::store::StoreError;

/// Errors of the encryption core
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Crypto has not been started for this session
    #[error("Encryption is not started")]
    NotStarted,

    /// `start` was called twice
    #[error("Encryption is already started")]
    AlreadyStarted,

    /// No key set exists for this account
    #[error("Encryption is not set up")]
    NotSetup,

    /// A key set already exists for this account
    #[error("Encryption is already set up")]
    AlreadySetup,

    /// The key set exists but its trial period has lapsed
    #[error("Encryption setup has expired")]
    SetupExpired,

    /// The session is not authenticated
    #[error("Not logged in")]
    NotLoggedIn,

    /// The account has no password hint stored
    #[error("No password hint is set")]
    HintNotProvided,

    /// The private key did not decrypt under the supplied password
    #[error("Bad password")]
    BadPassword,

    /// Public and private key failed the round-trip check
    #[error("Keys don't match")]
    KeysDontMatch,

    /// A key blob carried an unrecognized version tag
    #[error("Unknown key format")]
    UnknownKeyFormat,

    /// A wrapped key failed to decrypt, parse or validate
    #[error("Invalid key")]
    InvalidKey,

    /// Unexpected RSA failure
    #[error("RSA error: {0}")]
    Rsa(String),

    /// Folder is not known locally or remotely
    #[error("Folder not found")]
    FolderNotFound,

    /// File is not known locally or remotely
    #[error("File not found")]
    FileNotFound,

    /// Operation requires an encrypted folder
    #[error("Folder is not encrypted")]
    FolderNotEncrypted,

    /// Transport-level failure after retries
    #[error("Cannot connect to server: {0}")]
    CantConnect(String),

    /// Server rejected the call; code and message preserved verbatim
    #[error("Server error {code}: {message}")]
    Api {
        /// Numeric result code from the server
        code: u64,
        /// Server-supplied message
        message: String,
    },

    /// Local metadata store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ApiError> for CryptoError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(msg) => CryptoError::CantConnect(msg),
            ApiError::Server { code, message } => CryptoError::Api { code, message },
            ApiError::Protocol(msg) => CryptoError::Api { code: 0, message: msg },
        }
    }
}

/// Result alias for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
