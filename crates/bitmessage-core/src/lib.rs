//! Bitmessage core protocol engine
//!
//! This crate provides the object/address model and wire codec, the crypto
//! adapter, and the proof-of-work engine for a Bitmessage node. It has no
//! knowledge of sockets or persistence; those are external ports implemented
//! by a daemon crate such as `bitmessaged`.
//!
//! # Modules
//!
//! - [`codec`]: varint/varstring/varbytes wire primitives.
//! - [`crypto`]: hashing, ECDSA, ECDH, and the CryptoBox ECIES envelope.
//! - [`address`]: Bitmessage address derivation and parsing.
//! - [`object`]: typed object payloads, signing preimages, encryption states.
//! - [`pow`]: proof-of-work target computation and nonce search.
//! - [`error`]: error types.

pub mod address;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod object;
pub mod pow;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
