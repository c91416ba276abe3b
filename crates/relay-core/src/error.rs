//! Error types for envelope parsing and secret handling.

use thiserror::Error;

/// Result type alias for envelope parsing.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Reasons an inbound message body cannot be turned into a pending message.
///
/// Any of these routes the raw body to the failed queue; none of them is
/// retried because redelivery would fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Body is not valid JSON.
    #[error("message body is not valid JSON: {message}")]
    InvalidJson {
        /// Parser error message
        message: String,
    },

    /// Body is valid JSON but not an object.
    #[error("message body must be a JSON object, found {found}")]
    NotAnObject {
        /// JSON type that was found instead
        found: &'static str,
    },

    /// A recognized field carries a value of the wrong type.
    #[error("field `{field}` must be {expected}, found {found}")]
    FieldType {
        /// Envelope field name
        field: &'static str,
        /// Expected JSON type
        expected: &'static str,
        /// JSON type that was found instead
        found: &'static str,
    },
}

impl EnvelopeError {
    /// Creates a JSON syntax error.
    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::InvalidJson { message: message.into() }
    }

    /// Creates a field type mismatch error.
    pub fn field_type(field: &'static str, expected: &'static str, found: &'static str) -> Self {
        Self::FieldType { field, expected, found }
    }
}

/// Failures while encrypting or decrypting an at-rest secret.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Input text or passphrase was empty.
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    /// Ciphertext is not valid base64.
    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Ciphertext is too short to hold an IV and at least one block.
    #[error("ciphertext too short: {len} bytes")]
    TooShort {
        /// Decoded ciphertext length
        len: usize,
    },

    /// Block cipher rejected the key or IV length.
    #[error("invalid key or IV length")]
    InvalidLength,

    /// PKCS7 padding check failed, usually a wrong passphrase.
    #[error("decryption failed: bad padding")]
    BadPadding,

    /// Decrypted bytes are not UTF-8.
    #[error("decrypted secret is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}
