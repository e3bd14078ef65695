//! Envelope crypto: AES-IGE for the v1/v2 wire envelope, AES-CTR for
//! the TCP obfuscation wrapper, and the MTProto-style KDFs (spec §4.1,
//! §6 "SOCKS5 tunneling" / obfuscated-2 framing).
//!
//! `original_source/.../VoIPController.cpp` hand-rolls AES-IGE itself
//! (no upstream C library exposes it); the pack carries no IGE crate
//! either, so this module builds IGE directly on top of RustCrypto's
//! `aes` block cipher, matching that precedent (see DESIGN.md).

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

pub const ENCRYPTION_KEY_LEN: usize = 256;
const BLOCK_LEN: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Direction byte used by the KDFs: 0 for packets sent by the call
/// initiator, 8 for the callee (spec §4.1). Roles reverse on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Initiator,
    Callee,
}

impl Direction {
    fn x(self) -> usize {
        match self {
            Direction::Initiator => 0,
            Direction::Callee => 8,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Direction::Initiator => Direction::Callee,
            Direction::Callee => Direction::Initiator,
        }
    }
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `msg_key = SHA1(inner)[4..20]` (v1, spec §4.1).
pub fn msg_key_v1(inner: &[u8]) -> [u8; 16] {
    let digest = sha1(inner);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[4..20]);
    out
}

/// `msg_key = SHA256(encryption_key[88+x..120+x] ‖ inner)[8..24]` (v2,
/// spec §4.1).
pub fn msg_key_v2(encryption_key: &[u8; ENCRYPTION_KEY_LEN], inner: &[u8], dir: Direction) -> [u8; 16] {
    let x = dir.x();
    let mut buf = Vec::with_capacity(32 + inner.len());
    buf.extend_from_slice(&encryption_key[88 + x..120 + x]);
    buf.extend_from_slice(inner);
    let digest = sha256(&buf);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[8..24]);
    out
}

/// Four-SHA1 key/iv derivation for the legacy (v1) envelope.
pub fn kdf_v1(encryption_key: &[u8; ENCRYPTION_KEY_LEN], msg_key: &[u8; 16], dir: Direction) -> ([u8; 32], [u8; 32]) {
    let x = dir.x();

    let mut buf_a = Vec::with_capacity(48);
    buf_a.extend_from_slice(msg_key);
    buf_a.extend_from_slice(&encryption_key[x..x + 32]);
    let a = sha1(&buf_a);

    let mut buf_b = Vec::with_capacity(48);
    buf_b.extend_from_slice(&encryption_key[32 + x..32 + x + 16]);
    buf_b.extend_from_slice(msg_key);
    buf_b.extend_from_slice(&encryption_key[48 + x..48 + x + 16]);
    let b = sha1(&buf_b);

    let mut buf_c = Vec::with_capacity(48);
    buf_c.extend_from_slice(&encryption_key[64 + x..64 + x + 32]);
    buf_c.extend_from_slice(msg_key);
    let c = sha1(&buf_c);

    let mut buf_d = Vec::with_capacity(48);
    buf_d.extend_from_slice(msg_key);
    buf_d.extend_from_slice(&encryption_key[96 + x..96 + x + 32]);
    let d = sha1(&buf_d);

    let mut key = [0u8; 32];
    key[0..8].copy_from_slice(&a[0..8]);
    key[8..20].copy_from_slice(&b[8..20]);
    key[20..32].copy_from_slice(&c[4..16]);

    let mut iv = [0u8; 32];
    iv[0..12].copy_from_slice(&a[8..20]);
    iv[12..20].copy_from_slice(&b[0..8]);
    iv[20..24].copy_from_slice(&c[16..20]);
    iv[24..32].copy_from_slice(&d[0..8]);

    (key, iv)
}

/// Two-SHA256 key/iv derivation for MTProto2 (v2).
pub fn kdf_v2(encryption_key: &[u8; ENCRYPTION_KEY_LEN], msg_key: &[u8; 16], dir: Direction) -> ([u8; 32], [u8; 32]) {
    let x = dir.x();

    let mut buf_a = Vec::with_capacity(52);
    buf_a.extend_from_slice(msg_key);
    buf_a.extend_from_slice(&encryption_key[x..x + 36]);
    let sha256_a = sha256(&buf_a);

    let mut buf_b = Vec::with_capacity(52);
    buf_b.extend_from_slice(&encryption_key[40 + x..40 + x + 36]);
    buf_b.extend_from_slice(msg_key);
    let sha256_b = sha256(&buf_b);

    let mut key = [0u8; 32];
    key[0..8].copy_from_slice(&sha256_a[0..8]);
    key[8..24].copy_from_slice(&sha256_b[8..24]);
    key[24..32].copy_from_slice(&sha256_a[24..32]);

    let mut iv = [0u8; 32];
    iv[0..8].copy_from_slice(&sha256_b[0..8]);
    iv[8..24].copy_from_slice(&sha256_a[8..24]);
    iv[24..32].copy_from_slice(&sha256_b[24..32]);

    (key, iv)
}

/// AES-256 in Infinite Garble Extension mode. `key_iv` is the 64-byte
/// concatenation `(aes_key[32] ‖ iv[32])` produced by the KDFs above,
/// where `iv = iv1[16] ‖ iv2[16]`.
pub fn aes_ige_encrypt(key: &[u8; 32], iv: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    assert!(plaintext.len() % BLOCK_LEN == 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(key.into());

    let mut prev_ciphertext: [u8; 16] = iv[0..16].try_into().unwrap();
    let mut prev_plaintext: [u8; 16] = iv[16..32].try_into().unwrap();

    let mut out = Vec::with_capacity(plaintext.len());
    for chunk in plaintext.chunks(BLOCK_LEN) {
        let mut block = [0u8; 16];
        for i in 0..16 {
            block[i] = chunk[i] ^ prev_ciphertext[i];
        }
        let mut ga = aes::cipher::generic_array::GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut ga);
        let mut ciphertext = [0u8; 16];
        for i in 0..16 {
            ciphertext[i] = ga[i] ^ prev_plaintext[i];
        }
        out.extend_from_slice(&ciphertext);
        prev_plaintext.copy_from_slice(chunk);
        prev_ciphertext = ciphertext;
    }
    out
}

pub fn aes_ige_decrypt(key: &[u8; 32], iv: &[u8; 32], ciphertext: &[u8]) -> Vec<u8> {
    assert!(ciphertext.len() % BLOCK_LEN == 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(key.into());

    let mut prev_ciphertext: [u8; 16] = iv[0..16].try_into().unwrap();
    let mut prev_plaintext: [u8; 16] = iv[16..32].try_into().unwrap();

    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(BLOCK_LEN) {
        let mut block = [0u8; 16];
        for i in 0..16 {
            block[i] = chunk[i] ^ prev_plaintext[i];
        }
        let mut ga = aes::cipher::generic_array::GenericArray::clone_from_slice(&block);
        cipher.decrypt_block(&mut ga);
        let mut plaintext = [0u8; 16];
        for i in 0..16 {
            plaintext[i] = ga[i] ^ prev_ciphertext[i];
        }
        out.extend_from_slice(&plaintext);
        prev_ciphertext.copy_from_slice(chunk);
        prev_plaintext = plaintext;
    }
    out
}

/// AES-256-CTR keystream applied in place, used by the TCP obfuscation
/// wrapper (spec §6) after its 64-byte handshake derives symmetric
/// keys for each direction.
pub fn aes_ctr_apply(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Pads `payload` with a random tail so the resulting buffer's length
/// is a multiple of 16. `min_pad`/`max_pad` bound the tail length
/// (legacy v1 pads to the next block; MTProto2 requires 12-1024 bytes
/// per spec §4.1).
pub fn pad_block_aligned(payload: &[u8], min_pad: usize, max_pad: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let base_len = payload.len() + min_pad;
    let remainder = base_len % BLOCK_LEN;
    let mut pad_len = if remainder == 0 { min_pad } else { min_pad + (BLOCK_LEN - remainder) };
    if pad_len > max_pad {
        pad_len = max_pad - (max_pad % BLOCK_LEN);
    }
    let mut out = Vec::with_capacity(payload.len() + pad_len);
    out.extend_from_slice(payload);
    let mut pad = vec![0u8; pad_len];
    rng.fill_bytes(&mut pad);
    out.extend_from_slice(&pad);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_ige_round_trips() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 32];
        let plaintext = b"0123456789abcdef0123456789abcdef".to_vec();
        let ct = aes_ige_encrypt(&key, &iv, &plaintext);
        assert_eq!(ct.len(), plaintext.len());
        let pt = aes_ige_decrypt(&key, &iv, &ct);
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn aes_ctr_round_trips() {
        let key = [0x33u8; 32];
        let iv = [0x44u8; 16];
        let mut data = b"hello obfuscated world!!".to_vec();
        let original = data.clone();
        aes_ctr_apply(&key, &iv, &mut data);
        assert_ne!(data, original);
        aes_ctr_apply(&key, &iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn kdf_v1_and_v2_change_with_direction() {
        let enc_key: [u8; 256] = {
            let mut k = [0u8; 256];
            for (i, b) in k.iter_mut().enumerate() {
                *b = i as u8;
            }
            k
        };
        let msg_key = [0x55u8; 16];
        let (key_a, iv_a) = kdf_v1(&enc_key, &msg_key, Direction::Initiator);
        let (key_b, iv_b) = kdf_v1(&enc_key, &msg_key, Direction::Callee);
        assert_ne!(key_a, key_b);
        assert_ne!(iv_a, iv_b);

        let (key_v2_a, _) = kdf_v2(&enc_key, &msg_key, Direction::Initiator);
        let (key_v2_b, _) = kdf_v2(&enc_key, &msg_key, Direction::Callee);
        assert_ne!(key_v2_a, key_v2_b);
    }

    #[test]
    fn pad_block_aligned_is_multiple_of_16() {
        let payload = vec![0u8; 37];
        let padded = pad_block_aligned(&payload, 12, 1024);
        assert_eq!(padded.len() % 16, 0);
        assert!(padded.len() >= payload.len() + 12);
    }
}
