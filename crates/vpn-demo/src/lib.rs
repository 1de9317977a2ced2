//! End-to-end demo wiring: a deterministic synthetic traffic generator,
//! the fair packet queue, and the secure-protocol decoder, all driven from
//! one [`vpn_pass::JobQueue`] with no background threads other than the
//! decoder's own worker pool.

pub mod pipeline;
pub mod scenario;
