//! Error types for the Bitmessage core crate

use thiserror::Error;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the codec, crypto adapter, address, object, and PoW
/// modules.
///
/// Network- and pipeline-level errors (disconnect decisions, repository
/// failures) live in their own crates and wrap these via `#[from]` where
/// relevant.
#[derive(Debug, Error)]
pub enum Error {
    /// Truncated buffer, non-minimal varint in strict mode, or a
    /// length-prefixed field exceeding its declared bound.
    #[error("malformed wire data: {0}")]
    MalformedWire(String),

    /// Well-framed bytes that do not parse into a known object payload.
    #[error("object decode error: {0}")]
    Decode(String),

    /// Base58 decode, checksum mismatch, or unsupported address version.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A secp256k1 scalar or point was malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// ECDSA signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// CryptoBox MAC mismatch or AES failure. Expected and silent in normal
    /// operation: most objects on the network are not addressed to us.
    #[error("decryption failed")]
    DecryptionFailed,

    /// The proof-of-work search was cancelled cooperatively.
    #[error("proof-of-work search cancelled")]
    Cancelled,

    /// A nonce did not meet the declared target.
    #[error("proof-of-work invalid: digest exceeds target")]
    PowInvalid,
}
