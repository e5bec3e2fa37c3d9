//! Tokenization core: format-preserving replacement of PANs by vault tokens.
//!
//! The raw PAN exists in exactly two places: transiently in the request path,
//! and as AES-256-GCM ciphertext inside the vault row. Everything else sees
//! the surrogate token, which shares the PAN's length and last four digits,
//! starts with '9', and is deliberately never Luhn-valid.

pub mod vault;

pub use vault::TokenVault;
