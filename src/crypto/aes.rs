//! AES-128-CBC for NAND data clusters.
//!
//! Every data cluster (indices 64..0x7EFF) is stored on the NAND as the
//! AES-128-CBC ciphertext of its 0x4000-byte plaintext, keyed with the
//! console's NAND AES key and a **zero IV restarted for every cluster**.
//! Superblock clusters are stored in plaintext and never pass through
//! this module.
//!
//! Restarting the IV at zero per cluster means two clusters holding
//! identical plaintext produce identical ciphertext. That is a weakness
//! of the original console design, not something the driver can fix:
//! compatibility requires reproducing it bit-for-bit.
//!
//! ## Pure-Rust implementation note
//!
//! To keep the dependency footprint small, AES is implemented here with a
//! compact lookup-table approach. This is not constant-time and should not
//! be used for security-sensitive applications, but it is correct and
//! sufficient for offline NAND image manipulation.

// The AES S-box is a 256-entry substitution table applied byte-by-byte during SubBytes.
// It is constructed by: (1) taking the multiplicative inverse of each byte in GF(2^8) - mapping 0 to 0,
// then (2) applying a fixed affine transformation over GF(2) to remove any remaining algebraic structure.
// https://en.wikipedia.org/wiki/Rijndael_S-box
const SBOX: [u8; 256] = [
    0x63, 0x7C, 0x77, 0x7B, 0xF2, 0x6B, 0x6F, 0xC5, 0x30, 0x01, 0x67, 0x2B, 0xFE, 0xD7, 0xAB, 0x76,
    0xCA, 0x82, 0xC9, 0x7D, 0xFA, 0x59, 0x47, 0xF0, 0xAD, 0xD4, 0xA2, 0xAF, 0x9C, 0xA4, 0x72, 0xC0,
    0xB7, 0xFD, 0x93, 0x26, 0x36, 0x3F, 0xF7, 0xCC, 0x34, 0xA5, 0xE5, 0xF1, 0x71, 0xD8, 0x31, 0x15,
    0x04, 0xC7, 0x23, 0xC3, 0x18, 0x96, 0x05, 0x9A, 0x07, 0x12, 0x80, 0xE2, 0xEB, 0x27, 0xB2, 0x75,
    0x09, 0x83, 0x2C, 0x1A, 0x1B, 0x6E, 0x5A, 0xA0, 0x52, 0x3B, 0xD6, 0xB3, 0x29, 0xE3, 0x2F, 0x84,
    0x53, 0xD1, 0x00, 0xED, 0x20, 0xFC, 0xB1, 0x5B, 0x6A, 0xCB, 0xBE, 0x39, 0x4A, 0x4C, 0x58, 0xCF,
    0xD0, 0xEF, 0xAA, 0xFB, 0x43, 0x4D, 0x33, 0x85, 0x45, 0xF9, 0x02, 0x7F, 0x50, 0x3C, 0x9F, 0xA8,
    0x51, 0xA3, 0x40, 0x8F, 0x92, 0x9D, 0x38, 0xF5, 0xBC, 0xB6, 0xDA, 0x21, 0x10, 0xFF, 0xF3, 0xD2,
    0xCD, 0x0C, 0x13, 0xEC, 0x5F, 0x97, 0x44, 0x17, 0xC4, 0xA7, 0x7E, 0x3D, 0x64, 0x5D, 0x19, 0x73,
    0x60, 0x81, 0x4F, 0xDC, 0x22, 0x2A, 0x90, 0x88, 0x46, 0xEE, 0xB8, 0x14, 0xDE, 0x5E, 0x0B, 0xDB,
    0xE0, 0x32, 0x3A, 0x0A, 0x49, 0x06, 0x24, 0x5C, 0xC2, 0xD3, 0xAC, 0x62, 0x91, 0x95, 0xE4, 0x79,
    0xE7, 0xC8, 0x37, 0x6D, 0x8D, 0xD5, 0x4E, 0xA9, 0x6C, 0x56, 0xF4, 0xEA, 0x65, 0x7A, 0xAE, 0x08,
    0xBA, 0x78, 0x25, 0x2E, 0x1C, 0xA6, 0xB4, 0xC6, 0xE8, 0xDD, 0x74, 0x1F, 0x4B, 0xBD, 0x8B, 0x8A,
    0x70, 0x3E, 0xB5, 0x66, 0x48, 0x03, 0xF6, 0x0E, 0x61, 0x35, 0x57, 0xB9, 0x86, 0xC1, 0x1D, 0x9E,
    0xE1, 0xF8, 0x98, 0x11, 0x69, 0xD9, 0x8E, 0x94, 0x9B, 0x1E, 0x87, 0xE9, 0xCE, 0x55, 0x28, 0xDF,
    0x8C, 0xA1, 0x89, 0x0D, 0xBF, 0xE6, 0x42, 0x68, 0x41, 0x99, 0x2D, 0x0F, 0xB0, 0x54, 0xBB, 0x16,
];

// The inverse S-box is the exact inverse lookup table of SBOX.
// Applying INV_SBOX after SBOX (or vice versa) returns the original byte, since the S-box is a bijection.
// https://en.wikipedia.org/wiki/Rijndael_S-box#Inverse_S-box
const INV_SBOX: [u8; 256] = [
    0x52, 0x09, 0x6A, 0xD5, 0x30, 0x36, 0xA5, 0x38, 0xBF, 0x40, 0xA3, 0x9E, 0x81, 0xF3, 0xD7, 0xFB,
    0x7C, 0xE3, 0x39, 0x82, 0x9B, 0x2F, 0xFF, 0x87, 0x34, 0x8E, 0x43, 0x44, 0xC4, 0xDE, 0xE9, 0xCB,
    0x54, 0x7B, 0x94, 0x32, 0xA6, 0xC2, 0x23, 0x3D, 0xEE, 0x4C, 0x95, 0x0B, 0x42, 0xFA, 0xC3, 0x4E,
    0x08, 0x2E, 0xA1, 0x66, 0x28, 0xD9, 0x24, 0xB2, 0x76, 0x5B, 0xA2, 0x49, 0x6D, 0x8B, 0xD1, 0x25,
    0x72, 0xF8, 0xF6, 0x64, 0x86, 0x68, 0x98, 0x16, 0xD4, 0xA4, 0x5C, 0xCC, 0x5D, 0x65, 0xB6, 0x92,
    0x6C, 0x70, 0x48, 0x50, 0xFD, 0xED, 0xB9, 0xDA, 0x5E, 0x15, 0x46, 0x57, 0xA7, 0x8D, 0x9D, 0x84,
    0x90, 0xD8, 0xAB, 0x00, 0x8C, 0xBC, 0xD3, 0x0A, 0xF7, 0xE4, 0x58, 0x05, 0xB8, 0xB3, 0x45, 0x06,
    0xD0, 0x2C, 0x1E, 0x8F, 0xCA, 0x3F, 0x0F, 0x02, 0xC1, 0xAF, 0xBD, 0x03, 0x01, 0x13, 0x8A, 0x6B,
    0x3A, 0x91, 0x11, 0x41, 0x4F, 0x67, 0xDC, 0xEA, 0x97, 0xF2, 0xCF, 0xCE, 0xF0, 0xB4, 0xE6, 0x73,
    0x96, 0xAC, 0x74, 0x22, 0xE7, 0xAD, 0x35, 0x85, 0xE2, 0xF9, 0x37, 0xE8, 0x1C, 0x75, 0xDF, 0x6E,
    0x47, 0xF1, 0x1A, 0x71, 0x1D, 0x29, 0xC5, 0x89, 0x6F, 0xB7, 0x62, 0x0E, 0xAA, 0x18, 0xBE, 0x1B,
    0xFC, 0x56, 0x3E, 0x4B, 0xC6, 0xD2, 0x79, 0x20, 0x9A, 0xDB, 0xC0, 0xFE, 0x78, 0xCD, 0x5A, 0xF4,
    0x1F, 0xDD, 0xA8, 0x33, 0x88, 0x07, 0xC7, 0x31, 0xB1, 0x12, 0x10, 0x59, 0x27, 0x80, 0xEC, 0x5F,
    0x60, 0x51, 0x7F, 0xA9, 0x19, 0xB5, 0x4A, 0x0D, 0x2D, 0xE5, 0x7A, 0x9F, 0x93, 0xC9, 0x9C, 0xEF,
    0xA0, 0xE0, 0x3B, 0x4D, 0xAE, 0x2A, 0xF5, 0xB0, 0xC8, 0xEB, 0xBB, 0x3C, 0x83, 0x53, 0x99, 0x61,
    0x17, 0x2B, 0x04, 0x7E, 0xBA, 0x77, 0xD6, 0x26, 0xE1, 0x69, 0x14, 0x63, 0x55, 0x21, 0x0C, 0x7D,
];

// Multiply two bytes together in GF(2^8) under AES's chosen irreducible polynomial x^8+x^4+x^3+x+1.
// Addition in this field is XOR; multiplication is carry-less polynomial multiplication followed by
// reduction mod the irreducible polynomial. Used by MixColumns and InvMixColumns to compute linear
// combinations of state bytes.
// https://en.wikipedia.org/wiki/Finite_field_arithmetic#Rijndael's_(AES)_finite_field
#[inline]
fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    for _ in 0..8 {
        if b & 1 != 0 {
            p ^= a; // add a into the product (XOR = addition in GF(2))
        }
        let hi = a & 0x80 != 0;
        a <<= 1; // multiply a by x
        if hi {
            a ^= 0x1B; // reduce mod 0x11B after overflowing 8 bits
        }
        b >>= 1;
    }
    p
}

// AES operates on a 4x4 matrix of bytes called the "state", stored here as a flat 16-byte array
// in column-major order: bytes [0..4] are column 0, bytes [4..8] are column 1, and so on.
// https://en.wikipedia.org/wiki/Advanced_Encryption_Standard#Description_of_the_cipher
type Block = [u8; 16];

// SubBytes: replace each byte of the state with the value at that index in the S-box.
// This is the only non-linear step in AES.
fn sub_bytes(s: &mut Block) {
    for b in s.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

fn inv_sub_bytes(s: &mut Block) {
    for b in s.iter_mut() {
        *b = INV_SBOX[*b as usize];
    }
}

// ShiftRows: cyclically shift the bytes in each row of the 4x4 state matrix to the left.
// Row 0 is not shifted; row i shifts by i. In column-major storage, row i consists of bytes
// at indices {i, i+4, i+8, i+12}.
// https://en.wikipedia.org/wiki/Advanced_Encryption_Standard#The_ShiftRows_step
fn shift_rows(s: &mut Block) {
    // Row 1: left-rotate by 1
    let t = s[1];
    s[1] = s[5];
    s[5] = s[9];
    s[9] = s[13];
    s[13] = t;
    // Row 2: left-rotate by 2 - two swaps
    s.swap(2, 10);
    s.swap(6, 14);
    // Row 3: left-rotate by 3 = right-rotate by 1
    let t = s[15];
    s[15] = s[11];
    s[11] = s[7];
    s[7] = s[3];
    s[3] = t;
}

// InvShiftRows: undo ShiftRows by cyclically right-shifting each row by its row index.
fn inv_shift_rows(s: &mut Block) {
    // Row 1: right-rotate by 1
    let t = s[13];
    s[13] = s[9];
    s[9] = s[5];
    s[5] = s[1];
    s[1] = t;
    // Row 2: right-rotate by 2 - same two swaps as the forward direction
    s.swap(2, 10);
    s.swap(6, 14);
    // Row 3: right-rotate by 3
    let t = s[3];
    s[3] = s[7];
    s[7] = s[11];
    s[11] = s[15];
    s[15] = t;
}

// MixColumns: treat each column of the state as a 4-term polynomial over GF(2^8) and multiply
// it by the fixed polynomial a(x) = {03}x^3 + {01}x^2 + {01}x + {02}, working modulo x^4 + 1.
// Equivalent to multiplying by a fixed 4x4 MDS matrix whose rows are cyclic shifts of [2, 3, 1, 1].
// https://en.wikipedia.org/wiki/Rijndael_MixColumns
fn mix_columns(s: &mut Block) {
    for i in 0..4 {
        let b = i * 4;
        let (s0, s1, s2, s3) = (s[b], s[b + 1], s[b + 2], s[b + 3]);
        s[b] = gmul(0x02, s0) ^ gmul(0x03, s1) ^ s2 ^ s3;
        s[b + 1] = s0 ^ gmul(0x02, s1) ^ gmul(0x03, s2) ^ s3;
        s[b + 2] = s0 ^ s1 ^ gmul(0x02, s2) ^ gmul(0x03, s3);
        s[b + 3] = gmul(0x03, s0) ^ s1 ^ s2 ^ gmul(0x02, s3);
    }
}

// InvMixColumns: the inverse of MixColumns. The inverse polynomial is
// a(x)^-1 mod x^4+1 = {0B}x^3 + {0D}x^2 + {09}x + {0E}.
// https://en.wikipedia.org/wiki/Rijndael_MixColumns#InvMixColumns
fn inv_mix_columns(s: &mut Block) {
    for i in 0..4 {
        let b = i * 4;
        let (s0, s1, s2, s3) = (s[b], s[b + 1], s[b + 2], s[b + 3]);
        s[b] = gmul(0x0E, s0) ^ gmul(0x0B, s1) ^ gmul(0x0D, s2) ^ gmul(0x09, s3);
        s[b + 1] = gmul(0x09, s0) ^ gmul(0x0E, s1) ^ gmul(0x0B, s2) ^ gmul(0x0D, s3);
        s[b + 2] = gmul(0x0D, s0) ^ gmul(0x09, s1) ^ gmul(0x0E, s2) ^ gmul(0x0B, s3);
        s[b + 3] = gmul(0x0B, s0) ^ gmul(0x0D, s1) ^ gmul(0x09, s2) ^ gmul(0x0E, s3);
    }
}

// AddRoundKey: XOR each byte of the state with the corresponding byte of the current round key.
// XOR is its own inverse, so the same operation works for both encryption and decryption.
fn add_round_key(s: &mut Block, rk: &[u8]) {
    for (b, k) in s.iter_mut().zip(rk.iter()) {
        *b ^= k;
    }
}

// Expand a 16-byte AES-128 key into 176 bytes of round key material (11 round keys of 16 bytes each).
// The schedule iteratively derives new 4-byte words from the previous ones using RotWord, SubWord,
// and XOR with a round constant. RCON values are powers of x in GF(2^8): RCON[i] = x^(i-1) mod 0x11B.
// https://en.wikipedia.org/wiki/AES_key_schedule
fn key_expand(key: &[u8; 16]) -> [u8; 176] {
    let mut w = [0u8; 176];
    w[..16].copy_from_slice(key); // round key 0 is the original key
    let rcon: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1B, 0x36];
    for i in 4..44usize {
        let mut t = [
            w[(i - 1) * 4],
            w[(i - 1) * 4 + 1],
            w[(i - 1) * 4 + 2],
            w[(i - 1) * 4 + 3],
        ];
        if i % 4 == 0 {
            // RotWord then SubWord, with RCON folded into the first byte
            t = [t[1], t[2], t[3], t[0]];
            t = [
                SBOX[t[0] as usize] ^ rcon[i / 4 - 1],
                SBOX[t[1] as usize],
                SBOX[t[2] as usize],
                SBOX[t[3] as usize],
            ];
        }
        for j in 0..4 {
            w[i * 4 + j] = w[(i - 4) * 4 + j] ^ t[j];
        }
    }
    w
}

// Encrypt a single 16-byte block with AES-128 (the standard 10-round Rijndael cipher).
// Round structure: 1 initial AddRoundKey, then 9 full rounds, then a final round without MixColumns.
// https://en.wikipedia.org/wiki/Advanced_Encryption_Standard#High-level_description_of_the_algorithm
fn encrypt_block(block: &Block, round_keys: &[u8; 176]) -> Block {
    let mut s = *block;
    add_round_key(&mut s, &round_keys[..16]);
    for round in 1..10 {
        sub_bytes(&mut s);
        shift_rows(&mut s);
        mix_columns(&mut s);
        add_round_key(&mut s, &round_keys[round * 16..(round + 1) * 16]);
    }
    sub_bytes(&mut s);
    shift_rows(&mut s);
    add_round_key(&mut s, &round_keys[160..]);
    s
}

// Decrypt a single 16-byte block using the inverse cipher: inverse operations in reverse order,
// with the final round omitting InvMixColumns just as encryption's final round omits MixColumns.
fn decrypt_block(block: &Block, round_keys: &[u8; 176]) -> Block {
    let mut s = *block;
    add_round_key(&mut s, &round_keys[160..]);
    for round in (1..10).rev() {
        inv_shift_rows(&mut s);
        inv_sub_bytes(&mut s);
        add_round_key(&mut s, &round_keys[round * 16..(round + 1) * 16]);
        inv_mix_columns(&mut s);
    }
    inv_shift_rows(&mut s);
    inv_sub_bytes(&mut s);
    add_round_key(&mut s, &round_keys[..16]);
    s
}

/// Encrypt a buffer in-place with AES-128-CBC.
///
/// CBC chains blocks by XORing each plaintext block with the previous
/// ciphertext block before encryption; the first block is XORed with `iv`.
/// The NAND driver calls this once per cluster with a zero IV, so clusters
/// are independent ciphertext units that can be rewritten without touching
/// their neighbours.
///
/// <https://en.wikipedia.org/wiki/Block_cipher_mode_of_operation#Cipher_block_chaining_(CBC)>
///
/// # Panics
/// Panics if `data.len()` is not a multiple of 16. Cluster and page sizes
/// are multiples of 16 by construction.
pub fn cbc_encrypt(data: &mut [u8], key: &[u8; 16], iv: &[u8; 16]) {
    assert!(data.len() % 16 == 0, "CBC input must be block-aligned");
    let rk = key_expand(key);
    let mut prev = *iv;
    for chunk in data.chunks_exact_mut(16) {
        let mut block: Block = chunk.try_into().unwrap();
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p; // chain: XOR with the previous ciphertext block (or the IV)
        }
        let ct = encrypt_block(&block, &rk);
        chunk.copy_from_slice(&ct);
        prev = ct;
    }
}

/// Decrypt a buffer in-place with AES-128-CBC.
///
/// The inverse of [`cbc_encrypt`]: each block is AES-decrypted and then
/// XORed with the previous ciphertext block (or the IV for the first
/// block).
///
/// # Panics
/// Panics if `data.len()` is not a multiple of 16.
pub fn cbc_decrypt(data: &mut [u8], key: &[u8; 16], iv: &[u8; 16]) {
    assert!(data.len() % 16 == 0, "CBC input must be block-aligned");
    let rk = key_expand(key);
    let mut prev = *iv;
    for chunk in data.chunks_exact_mut(16) {
        let ct: Block = chunk.try_into().unwrap();
        let mut pt = decrypt_block(&ct, &rk);
        for (b, p) in pt.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        chunk.copy_from_slice(&pt);
        prev = ct;
    }
}
