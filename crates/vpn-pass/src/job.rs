//! Deferred-job primitive.
//!
//! A cooperative, single-shot scheduling mechanism used to break reentrancy
//! between the two halves of a [`crate::PacketPass`] channel and between a
//! `FairQueue`'s scheduler and its flows. A [`Job`] is armed with [`Job::set`]
//! and disarmed with [`Job::unset`]; armed jobs fire exactly once, in FIFO
//! order relative to other jobs on the same [`JobQueue`], the next time
//! [`JobQueue::run`] is called. A job armed from within a callback running
//! during `run` never fires during that same `run` call.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

struct JobEntry {
    queued: Cell<bool>,
    callback: RefCell<Box<dyn FnMut()>>,
}

/// A group of deferred jobs sharing one FIFO order and one owner context.
#[derive(Clone)]
pub struct JobQueue {
    inner: Rc<RefCell<VecDeque<Rc<JobEntry>>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        JobQueue {
            inner: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Create a new, initially-disarmed job bound to this queue.
    pub fn new_job(&self, callback: impl FnMut() + 'static) -> Job {
        Job {
            entry: Rc::new(JobEntry {
                queued: Cell::new(false),
                callback: RefCell::new(Box::new(callback)),
            }),
            queue: self.clone(),
        }
    }

    /// Run every job that was armed before this call. Jobs armed by a
    /// callback invoked during this call are deferred to the next `run`.
    pub fn run(&self) {
        let pending = self.inner.borrow().len();
        for _ in 0..pending {
            let entry = match self.inner.borrow_mut().pop_front() {
                Some(entry) => entry,
                None => break,
            };
            if entry.queued.get() {
                entry.queued.set(false);
                (entry.callback.borrow_mut())();
            }
        }
    }

    /// Whether any job is currently armed.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().iter().all(|e| !e.queued.get())
    }

    fn enqueue(&self, entry: Rc<JobEntry>) {
        self.inner.borrow_mut().push_back(entry);
    }
}

/// A single-shot deferred callback. Cloning is not supported; arm/disarm
/// through the handle returned by [`JobQueue::new_job`].
pub struct Job {
    entry: Rc<JobEntry>,
    queue: JobQueue,
}

impl Job {
    /// Arm the job. Idempotent: calling `set` on an already-armed job is a
    /// no-op (it does not move position in the queue or double-fire).
    pub fn set(&self) {
        if !self.entry.queued.replace(true) {
            self.queue.enqueue(Rc::clone(&self.entry));
        }
    }

    /// Disarm the job. Idempotent. Safe to call whether or not the job is
    /// currently armed.
    pub fn unset(&self) {
        self.entry.queued.set(false);
    }

    /// Whether the job is currently armed.
    pub fn is_set(&self) -> bool {
        self.entry.queued.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn fires_once_in_fifo_order() {
        let jobs = JobQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        let a = jobs.new_job(move || o1.borrow_mut().push("a"));
        let o2 = order.clone();
        let b = jobs.new_job(move || o2.borrow_mut().push("b"));

        b.set();
        a.set();
        jobs.run();

        assert_eq!(*order.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn set_is_idempotent() {
        let jobs = JobQueue::new();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let job = jobs.new_job(move || *c.borrow_mut() += 1);

        job.set();
        job.set();
        job.set();
        jobs.run();

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn unset_prevents_firing() {
        let jobs = JobQueue::new();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let job = jobs.new_job(move || *f.borrow_mut() = true);

        job.set();
        job.unset();
        jobs.run();

        assert!(!*fired.borrow());
    }

    #[test]
    fn rearm_from_within_callback_defers_to_next_run() {
        let jobs = JobQueue::new();
        let runs = Rc::new(RefCell::new(0));

        // self-referential job: re-arms itself once, from inside its own callback
        let jobs_for_job = jobs.clone();
        let runs_for_job = runs.clone();
        let job_cell: Rc<RefCell<Option<Job>>> = Rc::new(RefCell::new(None));
        let job_cell_for_cb = job_cell.clone();
        let job = jobs_for_job.new_job(move || {
            *runs_for_job.borrow_mut() += 1;
            if *runs_for_job.borrow() == 1 {
                job_cell_for_cb.borrow().as_ref().unwrap().set();
            }
        });
        *job_cell.borrow_mut() = Some(job);

        job_cell.borrow().as_ref().unwrap().set();
        jobs.run();
        assert_eq!(*runs.borrow(), 1, "rearm must not fire within the same run()");

        jobs.run();
        assert_eq!(*runs.borrow(), 2);
    }
}
