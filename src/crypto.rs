//! Key material for token signing and verification

pub mod jwks;
pub mod keystore;

pub use jwks::{jwks_bytes, jwks_handler, jwks_response};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore, SigningAlgorithm, SigningKey};
