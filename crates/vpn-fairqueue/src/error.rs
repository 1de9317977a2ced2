use thiserror::Error;

/// Failures from [`crate::FairQueue::new`]. Both are configuration errors
/// caught at construction, never at runtime.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    /// `packet_weight` must be strictly positive: a zero weight makes
    /// `output.mtu + packet_weight <= MAX_TIME` trivially satisfiable,
    /// which defeats the bound it is meant to enforce.
    #[error("packet_weight must be > 0")]
    ZeroPacketWeight,

    /// `output.mtu + packet_weight` must not exceed `FAIRQUEUE_MAX_TIME`,
    /// or a single enqueue could overflow the virtual clock even right
    /// after a rebase.
    #[error("output.mtu ({mtu}) + packet_weight ({packet_weight}) exceeds FAIRQUEUE_MAX_TIME")]
    ExceedsMaxTime { mtu: usize, packet_weight: u64 },
}
