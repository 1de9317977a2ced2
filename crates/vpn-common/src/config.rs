//! Negotiated parameters for the secure-protocol decoder/encoder and the
//! fair packet queue. Plain, serde-derived structs — no file or CLI parsing
//! lives here (command-line/config plumbing is out of scope for the core
//! crates); a host application loads these however it likes, e.g. from TOML.

use serde::{Deserialize, Serialize};

/// Negotiated security parameters for one SPProto session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpParams {
    /// Whether frames are CBC-encrypted (IV prefix + terminator-and-zero padding).
    pub encryption_enabled: bool,
    /// Block size of the cipher in bytes, when `encryption_enabled`.
    pub block_size: usize,
    /// Whether frames carry a keyed-hash authentication field.
    pub hash_enabled: bool,
    /// Size of the hash field in bytes, when `hash_enabled`.
    pub hash_size: usize,
    /// Whether frames carry an OTP replay-guard sub-field.
    pub otp_enabled: bool,
}

impl Default for SpParams {
    fn default() -> Self {
        SpParams {
            encryption_enabled: false,
            block_size: 16,
            hash_enabled: false,
            hash_size: 16,
            otp_enabled: false,
        }
    }
}

impl SpParams {
    /// `OTP_LEN` is fixed by the wire format: a `u16` seed id plus a `u16`
    /// OTP value.
    pub const OTP_LEN: usize = 4;

    /// `HEADER_LEN(params) = OTP_LEN * have_otp + HASH_LEN * have_hash`.
    pub fn header_len(&self) -> usize {
        (if self.otp_enabled { Self::OTP_LEN } else { 0 })
            + (if self.hash_enabled { self.hash_size } else { 0 })
    }

    /// Offset of the OTP sub-field within the header (it precedes the hash
    /// sub-field when both are present).
    pub fn otp_offset(&self) -> usize {
        0
    }

    /// Offset of the hash sub-field within the header.
    pub fn hash_offset(&self) -> usize {
        if self.otp_enabled { Self::OTP_LEN } else { 0 }
    }
}

/// Parameters for a [`vpn_fairqueue`]-style fair queue that a host
/// application constructs declaratively (e.g. from a config file) before
/// calling `FairQueue::new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairQueueParams {
    /// Added to every packet's length to compute its virtual cost, so
    /// zero-length packets still advance virtual time. Must be `> 0`.
    pub packet_weight: u64,
    /// Whether `flow_request_cancel` is permitted on this queue.
    pub use_cancel: bool,
}

impl Default for FairQueueParams {
    fn default() -> Self {
        FairQueueParams {
            packet_weight: 1,
            use_cancel: true,
        }
    }
}
