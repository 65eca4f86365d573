//! Group engine implementations
//!
//! `SimpleGroupEngine` is the in-tree reference engine. Anything that
//! implements [`CryptoGroupEngine`](crate::core_mls::traits::CryptoGroupEngine)
//! can replace it.

pub(crate) mod crypto;
pub mod simple;
pub(crate) mod wire;

pub use simple::{SimpleGroupEngine, CIPHERSUITE, CLIENT_NAME, PROTOCOL_VERSION};
