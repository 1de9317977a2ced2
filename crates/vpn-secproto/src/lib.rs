//! # vpn-secproto
//!
//! SPProto framing and the Secure-Protocol Decoder (SPD): optional CBC
//! encryption, a keyed-hash authentication field, and an OTP replay guard,
//! composed over one wire format.
//!
//! ## Crate structure
//!
//! - [`wire`] — frame layout and carrier/payload MTU conversion
//! - [`crypto`] — AES-128-CBC, the bespoke padding scheme, keyed-hash helpers
//! - [`otp`] — per-seed OTP generation and bounded replay detection
//! - [`worker`] — the owner-context-safe worker pool the decoder offloads to
//! - [`decoder`] — the SPD state machine
//! - [`encode`] — frame construction, the decoder's inverse
//! - [`error`] — construction-time failures

pub mod crypto;
pub mod decoder;
pub mod encode;
pub mod error;
pub mod otp;
pub mod wire;
pub mod worker;

pub use decoder::Decoder;
pub use error::InitError;
pub use otp::{OtpChecker, OtpEvent, OtpTable};
pub use worker::{DecodeOutcome, ThreadWorkerPool, WorkerHandle, WorkerPool};
