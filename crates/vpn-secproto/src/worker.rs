//! Worker pool offloading the decoder's heavy cryptographic work off the
//! owner context.
//!
//! The decoder only depends on the [`WorkerPool`] trait; this module
//! supplies a concrete implementation backed by a fixed-size `std::thread`
//! pool communicating over `crossbeam_channel`.
//!
//! The work closure crosses to a worker thread (`Send`); the completion
//! callback never does — it is invoked back on the owner context from
//! [`ThreadWorkerPool::pump`], which the owner must call periodically (the
//! same discipline as [`vpn_pass::job::JobQueue::run`]). The happens-before
//! edge between "work finished on its thread" and "completion observed by
//! the owner" is the `crossbeam_channel::Sender::send` that ships the
//! result: channel sends establish a happens-before relationship with the
//! matching receive, so the owner-context callback always sees the work's
//! writes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Result of one decode-work closure: `None` if the frame was rejected
/// (bad padding, bad hash — the specific reason is logged by the closure
/// itself before returning, since logging must happen wherever the
/// rejection is detected, and `decode_work` runs off the owner context).
pub struct DecodeOutcome {
    pub plaintext: Option<Bytes>,
    pub seed_id: u16,
    pub otp: u16,
}

type Work = Box<dyn FnOnce() -> DecodeOutcome + Send>;
type Completion = Box<dyn FnOnce(DecodeOutcome)>;

/// A submitted unit of work. `cancel()` implements "free the worker
/// handle": the closure is allowed to run to completion on its thread
/// regardless, but its result is discarded rather than delivered.
pub struct WorkerHandle {
    id: u64,
    valid: Rc<Cell<bool>>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.valid.set(false);
    }
}

pub trait WorkerPool {
    fn submit(&self, work: Work, on_complete: Completion) -> WorkerHandle;
    /// Invoke the completion callback of every job that has finished since
    /// the last call, on the calling (owner) context. A no-op if nothing
    /// has completed.
    fn pump(&self);
}

struct Job {
    id: u64,
    outcome: DecodeOutcome,
}

/// A fixed-size pool of OS threads reading work off one shared queue.
pub struct ThreadWorkerPool {
    job_tx: Sender<(u64, Work)>,
    completion_rx: Receiver<Job>,
    next_id: Cell<u64>,
    pending: RefCell<HashMap<u64, Completion>>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadWorkerPool {
    pub fn new(num_threads: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<(u64, Work)>();
        let (completion_tx, completion_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads.max(1) {
            let job_rx = job_rx.clone();
            let completion_tx = completion_tx.clone();
            workers.push(thread::spawn(move || {
                while let Ok((id, work)) = job_rx.recv() {
                    let outcome = work();
                    if completion_tx.send(Job { id, outcome }).is_err() {
                        break; // owner side gone
                    }
                }
            }));
        }
        ThreadWorkerPool {
            job_tx,
            completion_rx,
            next_id: Cell::new(0),
            pending: RefCell::new(HashMap::new()),
            _workers: workers,
        }
    }
}

impl Drop for ThreadWorkerPool {
    fn drop(&mut self) {
        // Dropping job_tx closes the channel; each worker's `recv()` then
        // returns Err and the thread exits on its own — no explicit join
        // needed since we don't wait for in-flight work to drain on drop.
    }
}

impl WorkerPool for ThreadWorkerPool {
    fn submit(&self, work: Work, on_complete: Completion) -> WorkerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let valid = Rc::new(Cell::new(true));
        let valid_for_cb = valid.clone();
        self.pending.borrow_mut().insert(
            id,
            Box::new(move |outcome| {
                if valid_for_cb.get() {
                    on_complete(outcome);
                }
            }),
        );
        let _ = self.job_tx.send((id, work));
        WorkerHandle { id, valid }
    }

    fn pump(&self) {
        while let Ok(job) = self.completion_rx.try_recv() {
            if let Some(cb) = self.pending.borrow_mut().remove(&job.id) {
                cb(job.outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn submitted_work_completes_and_pump_delivers_it() {
        let pool = ThreadWorkerPool::new(2);
        let got = Rc::new(StdRefCell::new(None));
        let got_cb = got.clone();
        pool.submit(
            Box::new(|| DecodeOutcome {
                plaintext: Some(Bytes::from_static(b"hi")),
                seed_id: 0,
                otp: 0,
            }),
            Box::new(move |outcome| *got_cb.borrow_mut() = outcome.plaintext),
        );

        // Worker threads run concurrently; poll pump() until the result lands.
        for _ in 0..1000 {
            pool.pump();
            if got.borrow().is_some() {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(got.borrow().as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn cancelled_handle_suppresses_its_completion_callback() {
        let pool = ThreadWorkerPool::new(2);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let handle = pool.submit(
            Box::new(|| DecodeOutcome {
                plaintext: Some(Bytes::new()),
                seed_id: 0,
                otp: 0,
            }),
            Box::new(move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();

        for _ in 0..1000 {
            pool.pump();
            std::thread::yield_now();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0, "cancelled handle's callback must not fire");
    }
}
