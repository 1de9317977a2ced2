//! SPProto frame layout and header offset math.
//!
//! ```text
//! [ IV (block_size bytes, iff encryption)     ]   <- not part of hashed region
//! [ header                                    ]
//!     [ OTP sub-field (iff OTP enabled)       ]
//!         seed_id : uint16 (LE)
//!         otp     : uint16 (LE)
//!     [ hash sub-field (iff hash enabled)     ]
//!         hash    : hash_size bytes (zeroed during hash computation)
//! [ payload (0 .. output_mtu bytes)           ]
//! [ 0x01 terminator        (iff encryption)   ]
//! [ zero padding to block boundary (iff enc)  ]
//! ```
//!
//! Header offsets: the OTP sub-field always precedes the hash sub-field.
//! `HEADER_LEN(params) = OTP_LEN * have_otp + HASH_LEN * have_hash`, matching
//! [`vpn_common::config::SpParams::header_len`].

use vpn_common::config::SpParams;

/// Round `n` up to the next multiple of `block_size`.
#[inline]
pub fn align_up(n: usize, block_size: usize) -> usize {
    let rem = n % block_size;
    if rem == 0 {
        n
    } else {
        n + (block_size - rem)
    }
}

/// Carrier (on-the-wire) MTU for a given negotiated `payload_mtu`: base is
/// the header plus the payload; encryption additionally reserves an IV
/// block up front and pads the `0x01`-terminated tail up to a block
/// boundary.
pub fn carrier_mtu_for_payload_mtu(params: &SpParams, payload_mtu: usize) -> usize {
    let base = params.header_len() + payload_mtu;
    if params.encryption_enabled {
        params.block_size + align_up(base + 1, params.block_size)
    } else {
        base
    }
}

/// Inverse of [`carrier_mtu_for_payload_mtu`]: the largest payload that
/// fits in `carrier_mtu` bytes on the wire. Used by [`crate::decoder::Decoder`]
/// to size its plaintext scratch buffer from the output channel's MTU.
pub fn payload_mtu_for_carrier_mtu(params: &SpParams, carrier_mtu: usize) -> usize {
    let mut payload_mtu = carrier_mtu.saturating_sub(params.header_len());
    if params.encryption_enabled {
        // carrier_mtu_for_payload_mtu is non-decreasing in payload_mtu, so
        // shrink until the formula fits.
        while payload_mtu > 0 && carrier_mtu_for_payload_mtu(params, payload_mtu) > carrier_mtu {
            payload_mtu -= 1;
        }
    }
    payload_mtu
}
