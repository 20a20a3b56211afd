//! SHA-1 and the HMAC-SHA1 builder used for NAND authentication.
//!
//! Every cluster and superblock on the NAND carries an HMAC-SHA1 tag
//! computed with the console's 20-byte NAND HMAC key over a 64-byte salt
//! followed by the payload. The salt binds the tag to the cluster's
//! identity (owner, name, position in the chain) so that a valid cluster
//! cannot be replayed at a different location.
//!
//! The HMAC construction is the standard RFC 2104 scheme: the key is
//! right-padded with zeros to the 64-byte SHA-1 block, XORed with 0x36
//! (ipad) for the inner hash and 0x5C (opad) for the outer hash.
//!
//! SHA-1 is cryptographically broken for collision resistance, but the
//! on-NAND format is fixed; interoperating with real console images
//! requires producing the exact same tags.
//! <https://en.wikipedia.org/wiki/SHA-1>

/// A 20-byte SHA-1 / HMAC-SHA1 digest.
pub type Digest = [u8; 20];

/// Streaming SHA-1 as specified in FIPS 180-4.
///
/// Data is processed in 64-byte blocks; partial input is buffered until a
/// full block is available. Finalization appends the 0x80 terminator, zero
/// padding and the 64-bit big-endian bit length.
pub struct Sha1 {
    // Five 32-bit chaining values, initialised to the FIPS 180-4 constants.
    state: [u32; 5],
    buffer: [u8; 64],
    buffered: usize,
    // Total message length in bytes; the padding encodes this in bits.
    length: u64,
}

impl Sha1 {
    pub fn new() -> Self {
        Self {
            state: [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476, 0xC3D2_E1F0],
            buffer: [0u8; 64],
            buffered: 0,
            length: 0,
        }
    }

    /// Absorb `data` into the running hash.
    pub fn update(&mut self, data: &[u8]) {
        self.length += data.len() as u64;
        let mut input = data;

        // Top up a partially filled buffer first.
        if self.buffered > 0 {
            let take = input.len().min(64 - self.buffered);
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&input[..take]);
            self.buffered += take;
            input = &input[take..];
            if self.buffered == 64 {
                let block = self.buffer;
                self.process_block(&block);
                self.buffered = 0;
            }
        }

        let mut chunks = input.chunks_exact(64);
        for chunk in &mut chunks {
            self.process_block(chunk.try_into().unwrap());
        }
        let rest = chunks.remainder();
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffered = rest.len();
    }

    /// Consume the hasher and produce the digest.
    pub fn finalize(mut self) -> Digest {
        let bit_length = self.length * 8;
        // One 0x80 byte, then zeros until 8 bytes remain in the block for the length.
        self.update(&[0x80]);
        while self.buffered != 56 {
            self.update(&[0x00]);
        }
        // update() would count these 8 bytes into self.length, so process directly.
        self.buffer[56..64].copy_from_slice(&bit_length.to_be_bytes());
        let block = self.buffer;
        self.process_block(&block);

        let mut digest = [0u8; 20];
        for (i, word) in self.state.iter().enumerate() {
            digest[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        digest
    }

    // The SHA-1 compression function: expand the 16-word block to 80 words
    // (each new word is a 1-bit left rotation of an XOR of four earlier words),
    // then run 80 rounds over the five chaining values with the round function
    // and constant changing every 20 rounds.
    fn process_block(&mut self, block: &[u8; 64]) {
        let mut w = [0u32; 80];
        for i in 0..16 {
            w[i] = u32::from_be_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
        }
        for i in 16..80 {
            w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
        }

        let [mut a, mut b, mut c, mut d, mut e] = self.state;
        for (i, word) in w.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | (!b & d), 0x5A82_7999),
                20..=39 => (b ^ c ^ d, 0x6ED9_EBA1),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC),
                _ => (b ^ c ^ d, 0xCA62_C1D6),
            };
            let t = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(*word);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = t;
        }

        self.state[0] = self.state[0].wrapping_add(a);
        self.state[1] = self.state[1].wrapping_add(b);
        self.state[2] = self.state[2].wrapping_add(c);
        self.state[3] = self.state[3].wrapping_add(d);
        self.state[4] = self.state[4].wrapping_add(e);
    }
}

impl Default for Sha1 {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental HMAC-SHA1 with the NAND's 20-byte key.
///
/// The two call sites (cluster and superblock authentication) both feed a
/// 64-byte salt first and the payload second, so the builder mirrors the
/// console's block-MAC interface: construct, `update` any number of times,
/// `finalize`.
pub struct HmacSha1 {
    inner: Sha1,
    key: [u8; 20],
}

impl HmacSha1 {
    /// Start a new MAC computation keyed with `key`.
    pub fn new(key: &[u8; 20]) -> Self {
        // Inner hash: H((key padded to 64 bytes) XOR ipad || message)
        let mut pad = [0x36u8; 64];
        for (p, k) in pad.iter_mut().zip(key.iter()) {
            *p ^= k;
        }
        let mut inner = Sha1::new();
        inner.update(&pad);
        Self { inner, key: *key }
    }

    /// Absorb message bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish the computation: H((key padded) XOR opad || inner digest).
    pub fn finalize(self) -> Digest {
        let inner_digest = self.inner.finalize();
        let mut pad = [0x5Cu8; 64];
        for (p, k) in pad.iter_mut().zip(self.key.iter()) {
            *p ^= k;
        }
        let mut outer = Sha1::new();
        outer.update(&pad);
        outer.update(&inner_digest);
        outer.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> Digest {
        let mut h = Sha1::new();
        h.update(data);
        h.finalize()
    }

    // FIPS 180 examples.
    #[test]
    fn sha1_known_answers() {
        assert_eq!(
            sha1(b""),
            [
                0xDA, 0x39, 0xA3, 0xEE, 0x5E, 0x6B, 0x4B, 0x0D, 0x32, 0x55, 0xBF, 0xEF, 0x95,
                0x60, 0x18, 0x90, 0xAF, 0xD8, 0x07, 0x09,
            ]
        );
        assert_eq!(
            sha1(b"abc"),
            [
                0xA9, 0x99, 0x3E, 0x36, 0x47, 0x06, 0x81, 0x6A, 0xBA, 0x3E, 0x25, 0x71, 0x78,
                0x50, 0xC2, 0x6C, 0x9C, 0xD0, 0xD8, 0x9D,
            ]
        );
    }

    #[test]
    fn sha1_is_independent_of_update_chunking() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let whole = sha1(&data);
        let mut h = Sha1::new();
        for chunk in data.chunks(17) {
            h.update(chunk);
        }
        assert_eq!(h.finalize(), whole);
    }

    // RFC 2202 test case 1: exactly our key size (20 bytes).
    #[test]
    fn hmac_sha1_rfc2202_vector() {
        let key = [0x0Bu8; 20];
        let mut mac = HmacSha1::new(&key);
        mac.update(b"Hi There");
        assert_eq!(
            mac.finalize(),
            [
                0xB6, 0x17, 0x31, 0x86, 0x55, 0x05, 0x72, 0x64, 0xE2, 0x8B, 0xC0, 0xB6, 0xFB,
                0x37, 0x8C, 0x8E, 0xF1, 0x46, 0xBE, 0x00,
            ]
        );
    }

    #[test]
    fn hmac_split_updates_match_single_update() {
        let key = [0x42u8; 20];
        let salt = [7u8; 64];
        let payload = vec![0xA5u8; 0x4000];

        let mut one = HmacSha1::new(&key);
        one.update(&salt);
        one.update(&payload);

        let mut two = HmacSha1::new(&key);
        let mut all = salt.to_vec();
        all.extend_from_slice(&payload);
        two.update(&all);

        assert_eq!(one.finalize(), two.finalize());
    }
}
