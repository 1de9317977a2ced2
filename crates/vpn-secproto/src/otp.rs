//! One-time-password replay guard: a keyed-hash-driven counter sequence per
//! seed, and a bounded replay window rejecting a `(seed_id, otp)` pair seen
//! twice.
//!
//! [`OtpChecker`] is the seam a caller can substitute their own
//! implementation through; [`OtpTable`] is the reference one, owned by
//! [`crate::decoder::Decoder`] when `sp_params.otp_enabled`.

use std::collections::{HashMap, VecDeque};

use crate::crypto;

/// How many recently accepted OTP values each seed remembers before the
/// oldest is evicted. Bounds memory; a replay older than this slides out
/// of the window and is (rarely, and only for a very stale attacker) no
/// longer detectable — the same trade-off as any bounded replay window.
const REPLAY_WINDOW: usize = 256;

/// Transitions `set_otp_handler` fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpEvent {
    /// The generator's counter wrapped; this seed can no longer produce
    /// fresh OTP values and should be rotated out by the peer.
    Exhausted,
    /// The first successful check since this seed was added.
    Ready,
}

/// Seam a caller can substitute for [`OtpTable`].
pub trait OtpChecker {
    fn check(&mut self, seed_id: u16, otp: u16) -> bool;
}

/// Derives a deterministic sequence of OTP values from `(key, iv, counter)`
/// using the same keyed-hash primitive already required for frame
/// authentication — no new crypto primitive introduced.
struct OtpGenerator {
    key: Vec<u8>,
    iv: Vec<u8>,
    counter: u32,
    exhausted: bool,
}

impl OtpGenerator {
    fn new(key: Vec<u8>, iv: Vec<u8>) -> Self {
        OtpGenerator {
            key,
            iv,
            counter: 0,
            exhausted: false,
        }
    }

    /// Value of the OTP at a given counter — pure function of the seed's
    /// key/iv, so replay detection never needs to "rewind" the generator.
    fn value_at(&self, counter: u32) -> u16 {
        let mut input = self.iv.clone();
        input.extend_from_slice(&counter.to_le_bytes());
        let digest = crypto::keyed_hash(&self.key, &input, 2);
        u16::from_le_bytes([digest[0], digest[1]])
    }
}

struct OtpSeed {
    generator: OtpGenerator,
    seen: VecDeque<u16>,
    seen_set: std::collections::HashSet<u16>,
    ever_checked: bool,
}

impl OtpSeed {
    fn new(key: Vec<u8>, iv: Vec<u8>) -> Self {
        OtpSeed {
            generator: OtpGenerator::new(key, iv),
            seen: VecDeque::with_capacity(REPLAY_WINDOW),
            seen_set: std::collections::HashSet::with_capacity(REPLAY_WINDOW),
            ever_checked: false,
        }
    }

    fn check(&mut self, otp: u16) -> bool {
        if self.seen_set.contains(&otp) {
            return false;
        }
        // Search a small forward window from the generator's current
        // counter: the peer's clock/counter may be slightly ahead of ours.
        let mut matched_at = None;
        for offset in 0..64u32 {
            let counter = self.generator.counter.wrapping_add(offset);
            if self.generator.value_at(counter) == otp {
                matched_at = Some(counter);
                break;
            }
        }
        let Some(counter) = matched_at else {
            return false;
        };
        if counter < self.generator.counter {
            return false; // generator already advanced past this counter
        }
        self.generator.counter = counter.wrapping_add(1);
        if self.generator.counter == 0 {
            self.generator.exhausted = true;
        }

        self.seen.push_back(otp);
        self.seen_set.insert(otp);
        if self.seen.len() > REPLAY_WINDOW {
            if let Some(evicted) = self.seen.pop_front() {
                self.seen_set.remove(&evicted);
            }
        }
        true
    }
}

/// Reference [`OtpChecker`]: a `seed_id -> OtpSeed` table. At least two OTP
/// seeds are required at construction time so the precondition is checked
/// in one place rather than at every call site.
pub struct OtpTable {
    seeds: HashMap<u16, OtpSeed>,
    capacity: usize,
    on_event: Box<dyn FnMut(u16, OtpEvent)>,
}

impl OtpTable {
    pub fn new(capacity: usize) -> Result<Self, crate::error::InitError> {
        if capacity < 2 {
            return Err(crate::error::InitError::TooFewOtpSeeds {
                have: capacity,
                need: 2,
            });
        }
        Ok(OtpTable {
            seeds: HashMap::with_capacity(capacity),
            capacity,
            on_event: Box::new(|_, _| {}),
        })
    }

    pub fn set_otp_handler(&mut self, handler: impl FnMut(u16, OtpEvent) + 'static) {
        self.on_event = Box::new(handler);
    }

    pub fn add_seed(&mut self, seed_id: u16, key: Vec<u8>, iv: Vec<u8>) {
        debug_assert!(
            self.seeds.len() < self.capacity,
            "OtpTable::add_seed: exceeds configured capacity"
        );
        self.seeds.insert(seed_id, OtpSeed::new(key, iv));
    }

    pub fn remove_seeds(&mut self) {
        self.seeds.clear();
    }
}

impl OtpChecker for OtpTable {
    fn check(&mut self, seed_id: u16, otp: u16) -> bool {
        let Some(seed) = self.seeds.get_mut(&seed_id) else {
            return false;
        };
        let was_exhausted = seed.generator.exhausted;
        let first_check = !seed.ever_checked;
        let ok = seed.check(otp);
        if ok {
            seed.ever_checked = true;
            if first_check {
                (self.on_event)(seed_id, OtpEvent::Ready);
            }
            if !was_exhausted && seed.generator.exhausted {
                (self.on_event)(seed_id, OtpEvent::Exhausted);
            }
        }
        ok
    }
}
