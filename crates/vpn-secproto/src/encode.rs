//! Frame construction: the inverse of [`crate::decoder::decode_work`].
//!
//! The round-trip property tests and the `vpn-demo` end-to-end wiring both
//! need a peer that actually produces frames the decoder accepts, so this
//! lives alongside the decoder in the same idiom rather than leaving every
//! test to hand-assemble frames byte by byte.

use bytes::{Bytes, BytesMut};
use vpn_common::config::SpParams;

use crate::crypto::{self, EncryptionKey};

/// Build one SPProto frame carrying `payload`. `otp` is `(seed_id, otp)`,
/// required iff `sp_params.otp_enabled`.
pub fn encode_frame(
    payload: &[u8],
    sp_params: &SpParams,
    key: Option<&EncryptionKey>,
    iv: [u8; 16],
    otp: Option<(u16, u16)>,
) -> Bytes {
    let header_len = sp_params.header_len();
    let mut plain = Vec::with_capacity(header_len + payload.len());
    plain.resize(header_len, 0);

    if sp_params.otp_enabled {
        let (seed_id, otp) = otp.expect("encode_frame: otp_enabled requires an (seed_id, otp) pair");
        let off = sp_params.otp_offset();
        plain[off..off + 2].copy_from_slice(&seed_id.to_le_bytes());
        plain[off + 2..off + 4].copy_from_slice(&otp.to_le_bytes());
    }
    plain.extend_from_slice(payload);

    if sp_params.hash_enabled {
        let off = sp_params.hash_offset();
        let key = key.expect("encode_frame: hash_enabled requires a key");
        let hash = crypto::keyed_hash(&key.key, &plain, sp_params.hash_size);
        plain[off..off + sp_params.hash_size].copy_from_slice(&hash);
    }

    if sp_params.encryption_enabled {
        let key = key.expect("encode_frame: encryption_enabled requires a key");
        crypto::append_padding(&mut plain, sp_params.block_size);
        crypto::cbc_encrypt_in_place(key, iv, &mut plain);
        let mut out = BytesMut::with_capacity(sp_params.block_size + plain.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&plain);
        out.freeze()
    } else {
        Bytes::from(plain)
    }
}
