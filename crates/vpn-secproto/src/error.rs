use thiserror::Error;

/// Failures from [`crate::decoder::Decoder::new`] and [`crate::otp::OtpTable::new`].
/// Both are configuration/allocation errors caught at construction — once a
/// `Decoder` exists, malformed frames are runtime data faults (logged and
/// dropped), never a Rust `Result`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("invalid decoder parameters: {0}")]
    InvalidParams(&'static str),

    #[error("OTP enabled but only {have} seed(s) configured, need at least {need}")]
    TooFewOtpSeeds { have: usize, need: usize },
}
