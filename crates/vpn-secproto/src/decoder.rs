//! Secure-Protocol Decoder: decrypt -> header parse -> hash verify -> OTP
//! check, offloading the cryptographic work to a [`crate::worker::WorkerPool`]
//! while preserving ordering and backpressure with its single upstream
//! source.
//!
//! # State machine
//!
//! States of the input channel x worker:
//!
//! - **idle**: no packet in flight.
//! - **decoding**: packet accepted, work closure submitted to the worker pool.
//! - **awaiting-output**: worker completed, plaintext submitted downstream,
//!   waiting for `output`'s completion.
//!
//! Transitions:
//! 1. `send` in idle -> copy the packet, submit worker -> decoding.
//! 2. Worker completes: free the worker handle. If decode produced a valid
//!    plaintext and (not OTP-enabled or the OTP check passes) -> submit to
//!    `output` -> awaiting-output. Else -> signal `input.done()` -> idle.
//! 3. `output`'s completion in awaiting-output -> signal `input.done()` -> idle.
//! 4. Rekey (`set_encryption_key` / `remove_encryption_key`) in decoding ->
//!    cancel the worker, signal `input.done()`, drop the packet -> idle. In
//!    awaiting-output -> left alone (the packet already reached downstream).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use vpn_common::config::SpParams;
use vpn_pass::{Done, JobQueue, PacketPass};

use crate::crypto::{self, EncryptionKey};
use crate::error::InitError;
use crate::otp::{OtpChecker, OtpEvent, OtpTable};
use crate::wire;
use crate::worker::{DecodeOutcome, WorkerHandle, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Idle,
    Decoding,
    AwaitingOutput,
}

struct DecoderInner {
    output: Rc<PacketPass>,
    input: Rc<PacketPass>,
    sp_params: SpParams,
    key: Option<EncryptionKey>,
    otp: Option<OtpTable>,
    state: DecoderState,
    in_flight_done: Option<Done>,
    worker_handle: Option<WorkerHandle>,
}

/// A Secure-Protocol Decoder over one downstream [`PacketPass`]. Owns its
/// own upstream-facing input channel, obtained via [`Decoder::input`].
pub struct Decoder {
    inner: Rc<RefCell<DecoderInner>>,
    worker_pool: Rc<dyn WorkerPool>,
}

impl Decoder {
    /// `num_otp_seeds` must be `>= 2` when `sp_params.otp_enabled`. The
    /// input channel's MTU is derived from `output.mtu()` via
    /// [`wire::carrier_mtu_for_payload_mtu`].
    pub fn new(
        output: Rc<PacketPass>,
        jobs: &JobQueue,
        sp_params: SpParams,
        num_otp_seeds: usize,
        worker_pool: Rc<dyn WorkerPool>,
    ) -> Result<Self, InitError> {
        if sp_params.encryption_enabled && sp_params.block_size != crypto::BLOCK_SIZE {
            return Err(InitError::InvalidParams("block_size must be 16 (AES-128)"));
        }
        if sp_params.hash_enabled && sp_params.hash_size > 32 {
            return Err(InitError::InvalidParams("hash_size exceeds the SHA-256 digest size"));
        }
        let otp = if sp_params.otp_enabled {
            Some(OtpTable::new(num_otp_seeds)?)
        } else {
            None
        };

        let carrier_mtu = wire::carrier_mtu_for_payload_mtu(&sp_params, output.mtu());
        let jobs = jobs.clone();
        let worker_pool_for_send = worker_pool.clone();

        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<DecoderInner>>| {
            let weak_for_input = weak.clone();
            let input = PacketPass::new(carrier_mtu, &jobs, move |buf, done| {
                on_input_send(&weak_for_input, worker_pool_for_send.as_ref(), buf, done);
            });
            RefCell::new(DecoderInner {
                output,
                input,
                sp_params,
                key: None,
                otp,
                state: DecoderState::Idle,
                in_flight_done: None,
                worker_handle: None,
            })
        });

        let weak_for_done = Rc::downgrade(&inner);
        inner.borrow().output.set_done_handler(move || on_output_done(&weak_for_done));

        Ok(Decoder { inner, worker_pool })
    }

    /// The channel the upstream source pushes carrier-format datagrams into.
    pub fn input(&self) -> Rc<PacketPass> {
        self.inner.borrow().input.clone()
    }

    /// Drain the worker pool's completed jobs, invoking their callbacks on
    /// this (the owner) context. The host's event loop must call this
    /// periodically, the same discipline as `JobQueue::run`.
    pub fn pump_worker_pool(&self) {
        self.worker_pool.pump();
    }

    pub fn set_encryption_key(&self, key: [u8; 16]) {
        let mut inner = self.inner.borrow_mut();
        inner.key = Some(EncryptionKey { key });
        cancel_in_flight_decode(&mut inner);
    }

    pub fn remove_encryption_key(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.key = None;
        cancel_in_flight_decode(&mut inner);
    }

    pub fn add_otp_seed(&self, seed_id: u16, key: Vec<u8>, iv: Vec<u8>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(table) = inner.otp.as_mut() {
            table.add_seed(seed_id, key, iv);
        }
    }

    pub fn remove_otp_seeds(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(table) = inner.otp.as_mut() {
            table.remove_seeds();
        }
    }

    pub fn set_otp_handler(&self, handler: impl FnMut(u16, OtpEvent) + 'static) {
        let mut inner = self.inner.borrow_mut();
        if let Some(table) = inner.otp.as_mut() {
            table.set_otp_handler(handler);
        }
    }
}

/// Cancel whatever decode is in flight for a rekey operation. A packet
/// already in `awaiting-output` is left alone — it already reached
/// downstream, rekeying cannot un-send it.
fn cancel_in_flight_decode(inner: &mut DecoderInner) {
    if inner.state == DecoderState::Decoding {
        if let Some(handle) = inner.worker_handle.take() {
            handle.cancel();
        }
        inner.state = DecoderState::Idle;
        if let Some(done) = inner.in_flight_done.take() {
            done.signal();
        }
    }
}

fn on_input_send(
    decoder_weak: &Weak<RefCell<DecoderInner>>,
    worker_pool: &dyn WorkerPool,
    buf: Bytes,
    done: Done,
) {
    let Some(decoder) = decoder_weak.upgrade() else {
        return;
    };
    let (sp_params, key, output_mtu) = {
        let mut inner = decoder.borrow_mut();
        debug_assert_eq!(inner.state, DecoderState::Idle, "Decoder: send while not idle");
        inner.state = DecoderState::Decoding;
        inner.in_flight_done = Some(done);
        (inner.sp_params, inner.key.clone(), inner.output.mtu())
    };

    let decoder_for_cb = decoder_weak.clone();
    let handle = worker_pool.submit(
        Box::new(move || decode_work(buf, sp_params, key, output_mtu)),
        Box::new(move |outcome| on_decode_complete(&decoder_for_cb, outcome)),
    );
    decoder.borrow_mut().worker_handle = Some(handle);
}

fn on_decode_complete(decoder_weak: &Weak<RefCell<DecoderInner>>, outcome: DecodeOutcome) {
    let Some(decoder) = decoder_weak.upgrade() else {
        return;
    };
    let mut inner = decoder.borrow_mut();
    inner.worker_handle = None;

    // Only spend the OTP window on a frame that already decrypted and
    // hashed cleanly: the reject-path sentinel (seed_id=0, otp=0) must
    // never reach `table.check`, or a malformed frame could desync seed
    // 0's generator and replay window for a later legitimate frame.
    let otp_ok = outcome.plaintext.is_some()
        && (!inner.sp_params.otp_enabled
            || match inner.otp.as_mut() {
                Some(table) => table.check(outcome.seed_id, outcome.otp),
                None => false,
            });
    if outcome.plaintext.is_some() && !otp_ok {
        tracing::warn!(seed_id = outcome.seed_id, "SPD: rejecting frame: OTP check failed");
    }

    match outcome.plaintext.filter(|_| otp_ok) {
        Some(payload) => {
            inner.state = DecoderState::AwaitingOutput;
            let output = inner.output.clone();
            drop(inner);
            output.send(payload);
        }
        None => {
            inner.state = DecoderState::Idle;
            let done = inner.in_flight_done.take();
            drop(inner);
            if let Some(done) = done {
                done.signal();
            }
        }
    }
}

fn on_output_done(decoder_weak: &Weak<RefCell<DecoderInner>>) {
    let Some(decoder) = decoder_weak.upgrade() else {
        return;
    };
    let mut inner = decoder.borrow_mut();
    debug_assert_eq!(inner.state, DecoderState::AwaitingOutput);
    inner.state = DecoderState::Idle;
    let done = inner
        .in_flight_done
        .take()
        .expect("Decoder: output done fired with no pending input completion");
    drop(inner);
    done.signal();
}

/// The only piece of decoder logic that may run off the owner context.
/// Its inputs are read-only except `carrier` (consumed) and
/// the returned [`DecodeOutcome`] (written only here, read only after
/// completion) — no shared mutable state crosses threads.
fn decode_work(carrier: Bytes, sp_params: SpParams, key: Option<EncryptionKey>, output_mtu: usize) -> DecodeOutcome {
    fn reject(reason: &str) -> DecodeOutcome {
        tracing::warn!(reason, "SPD: rejecting frame");
        DecodeOutcome {
            plaintext: None,
            seed_id: 0,
            otp: 0,
        }
    }

    let header_len = sp_params.header_len();

    let mut plain: Vec<u8> = if sp_params.encryption_enabled {
        if carrier.len() < sp_params.block_size * 2 {
            return reject("frame shorter than IV plus one block");
        }
        let (iv_bytes, rest) = carrier.split_at(sp_params.block_size);
        if rest.len() % sp_params.block_size != 0 {
            return reject("ciphertext not block-aligned");
        }
        let Some(key) = key.as_ref() else {
            return reject("no encryption key set");
        };
        let mut iv = [0u8; 16];
        iv.copy_from_slice(iv_bytes);
        let mut buf = rest.to_vec();
        crypto::cbc_decrypt_in_place(key, iv, &mut buf);

        let Some(total_len) = crypto::scan_padding(&buf, sp_params.block_size) else {
            return reject("bad padding");
        };
        if total_len < header_len {
            return reject("frame shorter than header");
        }
        buf.truncate(total_len);
        buf
    } else {
        if carrier.len() < header_len {
            return reject("frame shorter than header");
        }
        carrier.to_vec()
    };

    let mut seed_id = 0u16;
    let mut otp = 0u16;
    if sp_params.otp_enabled {
        let off = sp_params.otp_offset();
        seed_id = u16::from_le_bytes([plain[off], plain[off + 1]]);
        otp = u16::from_le_bytes([plain[off + 2], plain[off + 3]]);
    }

    if sp_params.hash_enabled {
        let off = sp_params.hash_offset();
        if off + sp_params.hash_size > plain.len() {
            return reject("frame shorter than hash field");
        }
        let received = plain[off..off + sp_params.hash_size].to_vec();
        plain[off..off + sp_params.hash_size].fill(0);
        let Some(key) = key.as_ref() else {
            return reject("no hash key set");
        };
        let expected = crypto::keyed_hash(&key.key, &plain, sp_params.hash_size);
        if !crypto::hash_matches(&received, &expected) {
            return reject("hash mismatch");
        }
    }

    if plain.len() - header_len > output_mtu {
        return reject("payload exceeds output mtu");
    }

    DecodeOutcome {
        plaintext: Some(Bytes::from(plain[header_len..].to_vec())),
        seed_id,
        otp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_frame;
    use crate::worker::ThreadWorkerPool;
    use vpn_pass::test_util::RecordingSink;

    fn drain(jobs: &JobQueue, decoder: &Decoder) {
        for _ in 0..64 {
            jobs.run();
            decoder.pump_worker_pool();
        }
    }

    fn no_crypto_params() -> SpParams {
        SpParams {
            encryption_enabled: false,
            hash_enabled: false,
            otp_enabled: false,
            ..Default::default()
        }
    }

    /// No encryption, no hash, no OTP, header_len=0 -> payload passes through unchanged.
    #[test]
    fn no_crypto_round_trips_payload() {
        let jobs = JobQueue::new();
        let (output, sink) = RecordingSink::new(1500, &jobs, true);
        let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
        let decoder = Decoder::new(output, &jobs, no_crypto_params(), 2, pool).unwrap();

        let frame = encode_frame(&[0xAA, 0xBB], &no_crypto_params(), None, [0u8; 16], None);
        decoder.input().send(frame);
        drain(&jobs, &decoder);

        assert_eq!(sink.received.borrow().len(), 1);
        assert_eq!(&sink.received.borrow()[0][..], &[0xAA, 0xBB]);
    }

    /// A carrier at exactly the input channel's MTU, crafted so the padding
    /// scan finds the terminator as the very last byte of the final block
    /// (no zero run) -> the decrypted payload is longer than `output_mtu`
    /// even though the carrier itself never exceeded the input MTU.
    /// Must be dropped, not panic `PacketPass::send`'s mtu assertion.
    #[test]
    fn oversized_payload_is_dropped_without_panicking() {
        let jobs = JobQueue::new();
        let output_mtu = 10;
        let (output, sink) = RecordingSink::new(output_mtu, &jobs, true);
        let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
        let params = SpParams {
            encryption_enabled: true,
            block_size: 16,
            hash_enabled: false,
            otp_enabled: false,
            ..Default::default()
        };
        let decoder = Decoder::new(output, &jobs, params, 2, pool).unwrap();
        let key = EncryptionKey { key: [4u8; 16] };
        decoder.set_encryption_key(key.key);

        // header_len=0, payload_len=15: 15 + 1 terminator byte = 16, exactly
        // one block, no zero padding run, decrypted length 15 > output_mtu.
        let payload = [0xCDu8; 15];
        let frame = encode_frame(&payload, &params, Some(&key), [1u8; 16], None);
        assert_eq!(frame.len(), decoder.input().mtu(), "frame must sit exactly at the input mtu");

        decoder.input().send(frame);
        drain(&jobs, &decoder);

        assert_eq!(sink.received.borrow().len(), 0, "oversized payload must not reach output");
        assert!(decoder.input().is_idle(), "input.done() must still fire on reject");
    }

    fn crypto_params() -> SpParams {
        SpParams {
            encryption_enabled: true,
            block_size: 16,
            hash_enabled: true,
            hash_size: 16,
            otp_enabled: false,
            ..Default::default()
        }
    }

    /// Last block ends without a 0x01 terminator -> dropped, input.done() fired, no output.send.
    #[test]
    fn bad_padding_is_dropped() {
        let jobs = JobQueue::new();
        let (output, sink) = RecordingSink::new(1500, &jobs, true);
        let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
        let params = crypto_params();
        let decoder = Decoder::new(output, &jobs, params, 2, pool).unwrap();
        let key = EncryptionKey { key: [9u8; 16] };
        decoder.set_encryption_key(key.key);

        let mut frame = encode_frame(&[1, 2, 3], &params, Some(&key), [5u8; 16], None).to_vec();
        // Corrupt the last byte (the terminator, once decrypted) by flipping
        // the final ciphertext block — garbles the decrypted tail so no
        // 0x01 terminator is found.
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let frame = Bytes::from(frame);

        decoder.input().send(frame);
        drain(&jobs, &decoder);

        assert_eq!(sink.received.borrow().len(), 0, "malformed frame must not reach output");
        assert!(decoder.input().is_idle(), "input.done() must still fire on reject");
    }

    /// Flip one byte in the header hash field -> hash mismatch, packet dropped.
    #[test]
    fn hash_mismatch_is_dropped() {
        let jobs = JobQueue::new();
        let (output, sink) = RecordingSink::new(1500, &jobs, true);
        let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
        let params = SpParams {
            encryption_enabled: false,
            hash_enabled: true,
            hash_size: 16,
            otp_enabled: false,
            ..Default::default()
        };
        let decoder = Decoder::new(output, &jobs, params, 2, pool).unwrap();
        let key = EncryptionKey { key: [1u8; 16] };
        decoder.set_encryption_key(key.key);

        let mut frame = encode_frame(&[9, 9, 9], &params, Some(&key), [0u8; 16], None).to_vec();
        let hash_off = params.hash_offset();
        frame[hash_off] ^= 0xFF;

        decoder.input().send(Bytes::from(frame));
        drain(&jobs, &decoder);

        assert_eq!(sink.received.borrow().len(), 0);
        assert!(decoder.input().is_idle());
    }

    /// Same (seed_id, otp) presented twice -> the second is dropped
    /// even though decrypt and hash succeed.
    #[test]
    fn otp_replay_is_dropped() {
        let jobs = JobQueue::new();
        let (output, sink) = RecordingSink::new(1500, &jobs, true);
        let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
        let params = SpParams {
            encryption_enabled: false,
            hash_enabled: false,
            otp_enabled: true,
            ..Default::default()
        };
        let decoder = Decoder::new(output, &jobs, params, 2, pool).unwrap();
        decoder.add_otp_seed(1, b"otpkey".to_vec(), b"otpiv".to_vec());

        // Find a valid (seed_id=1, otp) pair by asking the decoder's own
        // generator sequence indirectly: seed the OTP field with the value
        // a fresh generator produces at counter 0, matching add_otp_seed above.
        let otp_value = crate::otp::test_support::first_otp_value(b"otpkey", b"otpiv");

        let frame1 = encode_frame(&[7, 7], &params, None, [0u8; 16], Some((1, otp_value)));
        let frame2 = encode_frame(&[8, 8], &params, None, [0u8; 16], Some((1, otp_value)));

        decoder.input().send(frame1);
        drain(&jobs, &decoder);
        assert_eq!(sink.received.borrow().len(), 1, "first presentation accepted");

        decoder.input().send(frame2);
        drain(&jobs, &decoder);
        assert_eq!(sink.received.borrow().len(), 1, "replayed (seed_id, otp) dropped");
        assert!(decoder.input().is_idle());
    }

    /// Round-trip property: encoder output decodes to the
    /// original payload bit-for-bit, across several configurations.
    #[test]
    fn round_trip_bit_identical_across_configs() {
        let configs = [
            no_crypto_params(),
            SpParams {
                encryption_enabled: true,
                block_size: 16,
                hash_enabled: true,
                hash_size: 16,
                otp_enabled: false,
                ..Default::default()
            },
            SpParams {
                encryption_enabled: true,
                block_size: 16,
                hash_enabled: true,
                hash_size: 20,
                otp_enabled: true,
                ..Default::default()
            },
        ];
        for params in configs {
            let jobs = JobQueue::new();
            let (output, sink) = RecordingSink::new(1500, &jobs, true);
            let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
            let decoder = Decoder::new(output, &jobs, params, 2, pool).unwrap();
            let key = EncryptionKey { key: [4u8; 16] };
            if params.encryption_enabled || params.hash_enabled {
                decoder.set_encryption_key(key.key);
            }
            if params.otp_enabled {
                decoder.add_otp_seed(1, b"seedkey".to_vec(), b"seediv".to_vec());
            }
            let otp_value = params
                .otp_enabled
                .then(|| crate::otp::test_support::first_otp_value(b"seedkey", b"seediv"));

            let payload = b"the quick brown fox";
            let key_ref = (params.encryption_enabled || params.hash_enabled).then_some(&key);
            let frame = encode_frame(payload, &params, key_ref, [2u8; 16], otp_value.map(|o| (1, o)));

            decoder.input().send(frame);
            drain(&jobs, &decoder);

            assert_eq!(sink.received.borrow().len(), 1, "{params:?}");
            assert_eq!(&sink.received.borrow()[0][..], &payload[..], "{params:?}");
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        /// For arbitrary payload bytes and arbitrary combinations of
        /// encryption/hash/OTP, `encode_frame` then the SPD yields the
        /// original payload bit-for-bit. Generalizes
        /// `round_trip_bit_identical_across_configs`'s fixed table to
        /// proptest-generated inputs.
        #[test]
        fn round_trip_is_bit_identical_for_arbitrary_payloads(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..300),
            encrypt in proptest::prelude::any::<bool>(),
            hash in proptest::prelude::any::<bool>(),
            otp in proptest::prelude::any::<bool>(),
        ) {
            let params = SpParams {
                encryption_enabled: encrypt,
                block_size: 16,
                hash_enabled: hash,
                hash_size: 16,
                otp_enabled: otp,
                ..Default::default()
            };
            let jobs = JobQueue::new();
            let (output, sink) = RecordingSink::new(1500, &jobs, true);
            let pool = Rc::new(ThreadWorkerPool::new(2)) as Rc<dyn WorkerPool>;
            let decoder = Decoder::new(output, &jobs, params, 2, pool).unwrap();
            let key = EncryptionKey { key: [6u8; 16] };
            if encrypt || hash {
                decoder.set_encryption_key(key.key);
            }
            if otp {
                decoder.add_otp_seed(1, b"propkey".to_vec(), b"propiv".to_vec());
            }
            let otp_value = otp.then(|| crate::otp::test_support::first_otp_value(b"propkey", b"propiv"));

            let key_ref = (encrypt || hash).then_some(&key);
            let frame = encode_frame(&payload, &params, key_ref, [3u8; 16], otp_value.map(|o| (1, o)));

            decoder.input().send(frame);
            drain(&jobs, &decoder);

            proptest::prop_assert_eq!(sink.received.borrow().len(), 1);
            proptest::prop_assert_eq!(&sink.received.borrow()[0][..], &payload[..]);
        }
    }
}
