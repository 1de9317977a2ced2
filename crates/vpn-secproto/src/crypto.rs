//! Block-cipher and keyed-hash collaborators for the decode pipeline.
//!
//! Concrete choices not specified at the protocol level: AES-128-CBC for
//! encryption (via the `aes`/`cbc` crates) and HMAC-SHA256 truncated to
//! `hash_size` bytes for the keyed hash. Padding is bespoke (a zero run
//! terminated by `0x01`), not the `cbc` crate's own PKCS#7 unpadding, so
//! blocks are encrypted/decrypted raw and the padding is scanned by hand.

use aes::Aes128;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Block size this module supports. `SpParams::block_size` must equal this
/// when encryption is enabled — AES-128 fixes the block size structurally,
/// it is not actually a free parameter of the cipher.
pub const BLOCK_SIZE: usize = 16;

/// Key material for one direction of CBC encryption, cloned in wholesale on
/// `set_encryption_key`.
#[derive(Clone)]
pub struct EncryptionKey {
    pub key: [u8; 16],
}

/// Encrypt `buf` (whose length must already be a multiple of [`BLOCK_SIZE`])
/// in place, CBC-chained from `iv`. `iv` is consumed by value because CBC
/// mutates its running IV as it processes blocks — the caller's copy is
/// never reused across calls.
pub fn cbc_encrypt_in_place(key: &EncryptionKey, iv: [u8; 16], buf: &mut [u8]) {
    debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
    let mut enc = Aes128CbcEnc::new(&key.key.into(), &iv.into());
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

/// Decrypt `buf` in place. Same block-size precondition as encryption.
pub fn cbc_decrypt_in_place(key: &EncryptionKey, iv: [u8; 16], buf: &mut [u8]) {
    debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
    let mut dec = Aes128CbcDec::new(&key.key.into(), &iv.into());
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

/// Scan padding from the tail of the final plaintext block: skip `0x00`
/// bytes, the first non-zero byte must be `0x01` and marks end-of-payload.
/// Returns the payload length (excluding the `0x01` terminator), or `None`
/// if the padding is malformed (a non-`{0x00, 0x01}` byte appears, or the
/// whole block is zero).
pub fn scan_padding(plain: &[u8], block_size: usize) -> Option<usize> {
    if plain.len() < block_size {
        return None;
    }
    let tail_start = plain.len() - block_size;
    let mut i = plain.len();
    while i > tail_start {
        i -= 1;
        match plain[i] {
            0x00 => continue,
            0x01 => return Some(i),
            _ => return None,
        }
    }
    None
}

/// Append the bespoke padding (a `0x01` terminator, then zero bytes up to
/// the next block boundary) to `payload`. Used by the encode side (tests,
/// `vpn-demo`) to build frames the decoder accepts. Mirrors
/// [`scan_padding`], which scans from the tail, skipping `0x00` bytes until
/// it finds this terminator.
pub fn append_padding(payload: &mut Vec<u8>, block_size: usize) {
    payload.push(0x01);
    let pad_to = crate::wire::align_up(payload.len(), block_size);
    payload.resize(pad_to, 0x00);
}

type HmacSha256 = Hmac<Sha256>;

/// Compute the keyed hash over `data` (with the header-hash field zeroed),
/// truncated to `hash_size` bytes.
pub fn keyed_hash(key: &[u8], data: &[u8], hash_size: usize) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    full[..hash_size].to_vec()
}

/// Constant-time comparison of the received hash field against the
/// recomputed one, so a timing side-channel can't leak how many leading
/// bytes matched.
pub fn hash_matches(received: &[u8], expected: &[u8]) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    received.ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_padding_finds_terminator_before_zero_run() {
        // layout: payload (10 bytes) | 0x01 terminator | zero pad to block boundary
        let mut payload = vec![0xAAu8; 10];
        append_padding(&mut payload, 16);
        assert_eq!(payload.len(), 16);
        assert_eq!(scan_padding(&payload, 16), Some(10));
    }

    #[test]
    fn scan_padding_rejects_missing_terminator() {
        let plain = vec![0x00u8; 16];
        assert_eq!(scan_padding(&plain, 16), None);
    }

    #[test]
    fn scan_padding_rejects_garbage_byte_in_tail() {
        let mut plain = vec![0xAAu8; 13];
        plain.extend_from_slice(&[0x01, 0x00, 0x02]); // 0x02 as the very last byte
        assert_eq!(scan_padding(&plain, 16), None);
    }

    #[test]
    fn cbc_round_trips() {
        let key = EncryptionKey { key: [7u8; 16] };
        let iv = [3u8; 16];
        let mut buf = vec![0x41u8; 32];
        let plain = buf.clone();
        cbc_encrypt_in_place(&key, iv, &mut buf);
        assert_ne!(buf, plain);
        cbc_decrypt_in_place(&key, iv, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn hash_matches_is_constant_time_equality() {
        let h1 = keyed_hash(b"key", b"data", 16);
        let h2 = keyed_hash(b"key", b"data", 16);
        let h3 = keyed_hash(b"key", b"other", 16);
        assert!(hash_matches(&h1, &h2));
        assert!(!hash_matches(&h1, &h3));
    }
}
