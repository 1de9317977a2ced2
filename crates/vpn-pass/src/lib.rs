//! `PacketPass`: a unidirectional, single-packet-in-flight push channel with
//! explicit completion signalling and an optional cooperative cancel hint.
//!
//! This is the shared glue between the fair packet queue (`vpn-fairqueue`)
//! and the secure-protocol decoder (`vpn-secproto`): both push one packet at
//! a time downstream and wait for [`Done::signal`] before sending the next.
//! All operations run on a single owner context (one thread, no blocking);
//! see the crate-level docs of `vpn-fairqueue` for the concurrency model.
//!
//! Packets travel as [`bytes::Bytes`] rather than a borrowed slice: the
//! design calls for "the buffer's bytes belong to the sender for the entire
//! in-flight interval", which can outlive the synchronous `send` call (a
//! fair-queue flow buffers a packet until it reaches the head of the heap;
//! the secure-protocol decoder buffers one across a worker-pool hop). A
//! refcounted `Bytes` gives that lifetime without a deep copy.

pub mod job;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;

pub use job::{Job, JobQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Idle,
    InFlight,
}

/// Handle to signal completion of the packet currently in flight.
///
/// Obtained as the second argument to the channel's `on_send` callback.
/// Call [`Done::signal`] exactly once, synchronously or later (e.g. after
/// a worker-pool task completes), to return the channel to idle. Dropping
/// a `Done` without signalling leaves the channel permanently in flight —
/// a programming error, not a runtime fault.
#[derive(Clone)]
pub struct Done(Weak<PacketPass>);

impl Done {
    pub fn signal(self) {
        if let Some(channel) = self.0.upgrade() {
            channel.mark_done();
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done").finish_non_exhaustive()
    }
}

/// A single-packet-in-flight push channel.
///
/// `mtu` is fixed at construction. The owner pushes packets with [`send`];
/// the consumer-supplied `on_send` handler is invoked with the packet and a
/// [`Done`] handle, and must call `Done::signal` once it is safe to reuse
/// the buffer. Completion is reported via an optional handler set with
/// [`set_done_handler`], which always fires on a later turn of the supplied
/// [`JobQueue`] — never synchronously from within `send` — so `send`/`done`
/// reentrancy is structurally impossible.
///
/// The consumer-side `on_send` handler is fixed at construction (whoever
/// builds the channel owns what "sending" means), but the done handler is
/// set separately: the producer driving `send` is often assembled after the
/// channel already exists (a fair-queue flow attaches to an already-built
/// output channel, a decoder attaches to an already-built downstream sink),
/// so there is no single constructor call at which both sides are known.
///
/// [`send`]: PacketPass::send
/// [`set_done_handler`]: PacketPass::set_done_handler
pub struct PacketPass {
    mtu: usize,
    state: Cell<ChannelState>,
    on_send: RefCell<Box<dyn FnMut(Bytes, Done)>>,
    on_done: RefCell<Box<dyn FnMut()>>,
    on_cancel: RefCell<Option<Box<dyn FnMut()>>>,
    done_job: Job,
    self_weak: Weak<PacketPass>,
}

impl PacketPass {
    /// `init(mtu, on_send, ctx)` from the design: `ctx` is whatever `on_send`
    /// closes over.
    pub fn new(mtu: usize, jobs: &JobQueue, on_send: impl FnMut(Bytes, Done) + 'static) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<PacketPass>| {
            let weak_for_job = weak.clone();
            let done_job = jobs.new_job(move || {
                if let Some(channel) = weak_for_job.upgrade() {
                    (channel.on_done.borrow_mut())();
                }
            });
            PacketPass {
                mtu,
                state: Cell::new(ChannelState::Idle),
                on_send: RefCell::new(Box::new(on_send)),
                on_done: RefCell::new(Box::new(|| {})),
                on_cancel: RefCell::new(None),
                done_job,
                self_weak: weak.clone(),
            }
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn is_idle(&self) -> bool {
        self.state.get() == ChannelState::Idle
    }

    /// Register (or replace) the completion handler. Not required; a
    /// channel with no handler silently drops completion notifications.
    pub fn set_done_handler(&self, handler: impl FnMut() + 'static) {
        *self.on_done.borrow_mut() = Box::new(handler);
    }

    /// Register the cancellation hint handler. Not required; channels with
    /// no registered handler silently ignore `request_cancel`.
    pub fn set_cancel_handler(&self, handler: impl FnMut() + 'static) {
        *self.on_cancel.borrow_mut() = Some(Box::new(handler));
    }

    /// Push one packet. Valid only when idle.
    pub fn send(&self, buf: Bytes) {
        debug_assert!(
            buf.len() <= self.mtu,
            "PacketPass::send: {} exceeds mtu {}",
            buf.len(),
            self.mtu
        );
        debug_assert!(self.is_idle(), "PacketPass::send: channel not idle");
        self.state.set(ChannelState::InFlight);
        let done = Done(self.self_weak.clone());
        (self.on_send.borrow_mut())(buf, done);
    }

    /// Idempotent cancellation hint. No state change is guaranteed; the
    /// consumer may ignore it and deliver the packet normally.
    pub fn request_cancel(&self) {
        if let Some(handler) = self.on_cancel.borrow_mut().as_mut() {
            handler();
        }
    }

    fn mark_done(&self) {
        debug_assert!(!self.is_idle(), "PacketPass::done: channel not in flight");
        self.state.set(ChannelState::Idle);
        self.done_job.set();
    }
}

/// A deterministic in-memory sink shared by this crate's and downstream
/// crates' tests (`vpn-fairqueue`, `vpn-secproto`): an ordinary module
/// rather than a `cfg(test)` one, so those crates can depend on it directly
/// instead of duplicating a test fixture per crate.
pub mod test_util {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records every packet pushed to it. When `auto_done` is false the
    /// `Done` handle for each packet is stashed in `pending` instead of
    /// being signalled, so a test can drive completion manually — useful
    /// for exercising deferred (worker-pool-style) completion paths.
    pub struct RecordingSink {
        pub received: Rc<RefCell<Vec<Bytes>>>,
        pub pending: Rc<RefCell<Vec<Done>>>,
    }

    impl RecordingSink {
        pub fn new(mtu: usize, jobs: &JobQueue, auto_done: bool) -> (Rc<PacketPass>, Self) {
            let received = Rc::new(RefCell::new(Vec::new()));
            let pending = Rc::new(RefCell::new(Vec::new()));
            let received_cb = received.clone();
            let pending_cb = pending.clone();
            let channel = PacketPass::new(mtu, jobs, move |buf, done| {
                received_cb.borrow_mut().push(buf);
                if auto_done {
                    done.signal();
                } else {
                    pending_cb.borrow_mut().push(done);
                }
            });
            (channel, RecordingSink { received, pending })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn send_then_done_round_trips_state() {
        let jobs = JobQueue::new();
        let got = Rc::new(RefCell::new(None));
        let got_cb = got.clone();
        let channel = PacketPass::new(16, &jobs, move |buf, done| {
            *got_cb.borrow_mut() = Some(buf);
            done.signal();
        });

        assert!(channel.is_idle());
        channel.send(Bytes::from_static(b"hello"));
        assert!(!channel.is_idle(), "done() is deferred, not yet idle");
        jobs.run();
        assert!(channel.is_idle());
        assert_eq!(got.borrow().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn done_invoked_synchronously_from_send_does_not_reenter_on_done() {
        let jobs = JobQueue::new();
        let on_done_calls = Rc::new(RefCell::new(0));
        let on_done_cb = on_done_calls.clone();
        let channel = PacketPass::new(16, &jobs, move |_buf, done| {
            // synchronous done from within send()
            done.signal();
        });
        channel.set_done_handler(move || {
            *on_done_cb.borrow_mut() += 1;
        });

        channel.send(Bytes::from_static(b"x"));
        // on_done must not have fired yet: it's deferred through the job queue.
        assert_eq!(*on_done_calls.borrow(), 0);
        jobs.run();
        assert_eq!(*on_done_calls.borrow(), 1);
    }

    #[test]
    fn request_cancel_is_a_noop_without_a_handler() {
        let jobs = JobQueue::new();
        let channel = PacketPass::new(16, &jobs, |_buf, done| done.signal());
        channel.request_cancel(); // must not panic
    }

    #[test]
    fn request_cancel_forwards_to_handler() {
        let jobs = JobQueue::new();
        let channel = PacketPass::new(16, &jobs, |_buf, done| done.signal());
        let hit = Rc::new(RefCell::new(false));
        let hit_cb = hit.clone();
        channel.set_cancel_handler(move || *hit_cb.borrow_mut() = true);
        channel.request_cancel();
        assert!(*hit.borrow());
    }
}
