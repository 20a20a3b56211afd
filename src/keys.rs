//! Key material for the NAND file system.
//!
//! Every consumer Wii ships with two per-console secrets relevant to the
//! file system, both programmed into the OTP area of the Hollywood SoC:
//!
//! * the **NAND AES key** (16 bytes) - encrypts the data half of every
//!   data cluster with AES-128-CBC;
//! * the **NAND HMAC key** (20 bytes) - authenticates clusters and
//!   superblocks via HMAC-SHA1 over a salted payload.
//!
//! This module intentionally avoids cryptographic operations - it is a
//! plain data container. Callers either supply the raw key bytes directly
//! or load them from a BootMii `keys.bin` dump with
//! [`NandKeys::load_bootmii_keys`].

use std::io::Read;

use crate::{Error, Result};

/// Size of a BootMii `keys.bin` dump.
const BOOTMII_KEYS_SIZE: usize = 0x400;
/// Offset of the 20-byte NAND HMAC key inside `keys.bin`.
const BOOTMII_HMAC_OFFSET: usize = 0x144;
/// Offset of the 16-byte NAND AES key inside `keys.bin`.
const BOOTMII_AES_OFFSET: usize = 0x158;

/// The key bundle needed to read and write a NAND image.
#[derive(Clone)]
pub struct NandKeys {
    /// 20-byte HMAC-SHA1 key for cluster and superblock authentication.
    pub hmac: [u8; 20],
    /// 16-byte AES-128 key for data cluster encryption.
    pub aes: [u8; 16],
}

impl NandKeys {
    /// Bundle raw key bytes.
    pub fn new(hmac: [u8; 20], aes: [u8; 16]) -> Self {
        Self { hmac, aes }
    }

    /// Load the NAND keys from a BootMii-format `keys.bin` dump.
    ///
    /// The dump is a fixed 0x400-byte blob: a human-readable header
    /// followed by the OTP and SEEPROM contents. The NAND HMAC key lives
    /// at offset 0x144 and the NAND AES key at offset 0x158.
    ///
    /// Returns [`Error::Invalid`] if the reader yields fewer than 0x400
    /// bytes.
    pub fn load_bootmii_keys<R: Read>(mut reader: R) -> Result<Self> {
        let mut dump = [0u8; BOOTMII_KEYS_SIZE];
        reader.read_exact(&mut dump).map_err(|_| Error::Invalid)?;

        let mut hmac = [0u8; 20];
        hmac.copy_from_slice(&dump[BOOTMII_HMAC_OFFSET..BOOTMII_HMAC_OFFSET + 20]);
        let mut aes = [0u8; 16];
        aes.copy_from_slice(&dump[BOOTMII_AES_OFFSET..BOOTMII_AES_OFFSET + 16]);
        Ok(Self { hmac, aes })
    }
}

// Key bytes stay out of logs and panic messages.
impl std::fmt::Debug for NandKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NandKeys").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_bootmii_keys_extracts_both_keys() {
        let mut dump = [0u8; BOOTMII_KEYS_SIZE];
        for (i, b) in dump.iter_mut().enumerate() {
            *b = i as u8;
        }
        let keys = NandKeys::load_bootmii_keys(&dump[..]).unwrap();
        assert_eq!(keys.hmac[0], dump[BOOTMII_HMAC_OFFSET]);
        assert_eq!(keys.hmac[19], dump[BOOTMII_HMAC_OFFSET + 19]);
        assert_eq!(keys.aes[0], dump[BOOTMII_AES_OFFSET]);
        assert_eq!(keys.aes[15], dump[BOOTMII_AES_OFFSET + 15]);
    }

    #[test]
    fn load_bootmii_keys_rejects_short_input() {
        let dump = [0u8; 0x100];
        assert_eq!(
            NandKeys::load_bootmii_keys(&dump[..]).unwrap_err(),
            Error::Invalid
        );
    }
}
