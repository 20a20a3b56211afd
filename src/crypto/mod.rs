//! Cryptographic operations for the NAND file system.
//!
//! This module contains pure-Rust implementations of the two primitives
//! the driver needs. All functions accept already-loaded key material;
//! key storage is handled by [`crate::keys::NandKeys`].
//!
//! The implementations here are intended for **offline NAND image
//! manipulation** only. They are not constant-time and should not be used
//! in contexts where timing side-channels are a concern.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`aes`]  | AES-128-CBC encryption/decryption of 0x4000-byte clusters with a zero IV |
//! | [`hmac`] | SHA-1 and the HMAC-SHA1 builder used to authenticate clusters and superblocks |

pub mod aes;
pub mod hmac;
