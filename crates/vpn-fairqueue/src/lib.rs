//! Start-time fair queueing scheduler: many producer-facing flows
//! multiplexed onto one downstream [`PacketPass`] output, each flow
//! advancing its own virtual clock so no flow can starve another.
//!
//! # Concurrency model
//!
//! Everything here runs on a single **owner context** — one thread, or one
//! cooperative task, never more than one at a time. There is no internal
//! locking: flow state lives behind plain `RefCell`s because the type
//! system only needs to catch accidental reentrancy, not guard against a
//! second thread. The scheduler never calls back into itself synchronously
//! — `output.done()` always re-enters through the [`vpn_pass::JobQueue`]
//! deferred-job primitive — so stack depth stays bounded regardless of how
//! many flows are waiting.
//!
//! A flow's state is owned entirely by its queue (a `HashMap<FlowId,
//! FlowInner>`); callers hold a [`FlowHandle`], an index plus a `Weak`
//! back-reference, never shared ownership of the flow itself.

mod error;
mod flow;
mod heap;

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use vpn_common::config::FairQueueParams;
use vpn_pass::{Done, JobQueue, PacketPass};

pub use error::InitError;
pub use flow::{FlowHandle, FlowId};

use flow::FlowInner;
use heap::HeapEntry;

/// Virtual time never exceeds this; the queue rebases before it would.
/// Chosen so far below `u64::MAX` that a rebase is never itself at risk of
/// overflowing the subtraction.
pub const FAIRQUEUE_MAX_TIME: u64 = u64::MAX / 2;

struct QueueInner {
    output: Rc<PacketPass>,
    jobs: JobQueue,
    flows: HashMap<FlowId, FlowInner>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    sending: Option<FlowId>,
    /// The flow that most recently finished sending. Not load-bearing for
    /// scheduling (the heap and `sending` are sufficient on their own); kept
    /// because the source models it explicitly as queue state, useful to a
    /// host for diagnostics (e.g. asserting vt strictly increases across
    /// consecutive sends of the same flow). A dangling reference (the flow
    /// it names has since been freed) is simply cleared, never dereferenced.
    prev_sent: Option<FlowId>,
    in_flight_len: usize,
    use_cancel: bool,
    packet_weight: u64,
    freeing: bool,
    schedule_job: vpn_pass::Job,
    next_seq: u64,
    next_flow_id: u64,
}

/// A start-time fair queueing scheduler over one downstream [`PacketPass`].
///
/// Cloning shares the same underlying queue (cheap `Rc` clone) — useful for
/// handing the queue itself to a busy-handler callback that wants to drive
/// the next send.
#[derive(Clone)]
pub struct FairQueue {
    inner: Rc<RefCell<QueueInner>>,
}

impl FairQueue {
    /// `output.mtu + packet_weight` must not exceed [`FAIRQUEUE_MAX_TIME`],
    /// and `packet_weight` must be nonzero (a zero weight would make that
    /// bound trivially true regardless of `output.mtu`, defeating it).
    pub fn new(
        output: Rc<PacketPass>,
        jobs: &JobQueue,
        params: FairQueueParams,
    ) -> Result<Self, InitError> {
        if params.packet_weight == 0 {
            return Err(InitError::ZeroPacketWeight);
        }
        let mtu = output.mtu() as u64;
        if mtu
            .checked_add(params.packet_weight)
            .map_or(true, |v| v > FAIRQUEUE_MAX_TIME)
        {
            return Err(InitError::ExceedsMaxTime {
                mtu: output.mtu(),
                packet_weight: params.packet_weight,
            });
        }

        let jobs = jobs.clone();
        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<QueueInner>>| {
            let weak_for_job = weak.clone();
            let schedule_job = jobs.new_job(move || {
                if let Some(queue) = weak_for_job.upgrade() {
                    run_scheduler(&queue);
                }
            });
            RefCell::new(QueueInner {
                output,
                jobs,
                flows: HashMap::new(),
                heap: BinaryHeap::new(),
                sending: None,
                prev_sent: None,
                in_flight_len: 0,
                use_cancel: params.use_cancel,
                packet_weight: params.packet_weight,
                freeing: false,
                schedule_job,
                next_seq: 0,
                next_flow_id: 0,
            })
        });

        let weak_for_done = Rc::downgrade(&inner);
        inner.borrow().output.set_done_handler(move || {
            if let Some(queue) = weak_for_done.upgrade() {
                on_output_done(&queue);
            }
        });

        Ok(FairQueue { inner })
    }

    /// Attach a new flow: `vt` starts at 0, not queued. Returns a handle
    /// exposing the flow's input channel to the producer.
    pub fn flow_init(&self) -> FlowHandle {
        let queue_weak = Rc::downgrade(&self.inner);
        let mut queue = self.inner.borrow_mut();
        let id = FlowId(queue.next_flow_id);
        queue.next_flow_id += 1;
        let mtu = queue.output.mtu();
        let jobs = queue.jobs.clone();

        let weak_for_send = queue_weak.clone();
        let input = PacketPass::new(mtu, &jobs, move |buf, done| {
            if let Some(queue_rc) = weak_for_send.upgrade() {
                let mut queue = queue_rc.borrow_mut();
                enqueue(&mut queue, id, buf, done);
            }
        });

        queue.flows.insert(
            id,
            FlowInner {
                vt: 0,
                queued: false,
                payload: None,
                send_done: None,
                busy_handler: None,
                input,
            },
        );

        FlowHandle {
            id,
            queue: queue_weak,
        }
    }

    /// Detach and drop a flow. Valid only while the flow is not busy, or
    /// while the queue is in its freeing state (see [`FairQueue::prepare_free`]).
    pub fn flow_free(&self, handle: &FlowHandle) {
        let Some(queue_rc) = handle.queue.upgrade() else {
            return;
        };
        let mut queue = queue_rc.borrow_mut();
        let busy = queue
            .flows
            .get(&handle.id)
            .map(|f| f.is_busy(queue.sending, handle.id))
            .unwrap_or(false);
        debug_assert!(
            !busy || queue.freeing,
            "FairQueue::flow_free: flow busy and queue not freeing"
        );
        queue.flows.remove(&handle.id);
        if queue.sending == Some(handle.id) {
            queue.sending = None;
        }
        if queue.prev_sent == Some(handle.id) {
            queue.prev_sent = None;
        }
        // Any stale heap entry for this id is discarded lazily: run_scheduler
        // and rebase both skip entries whose flow no longer exists.
    }

    /// A flow is busy iff it is queued, or it is the flow currently sending
    /// at the queue's output.
    pub fn flow_is_busy(&self, handle: &FlowHandle) -> bool {
        let Some(queue_rc) = handle.queue.upgrade() else {
            return false;
        };
        let queue = queue_rc.borrow();
        queue
            .flows
            .get(&handle.id)
            .map(|f| f.is_busy(queue.sending, handle.id))
            .unwrap_or(false)
    }

    /// Forward a cooperative cancel hint to the output, but only if `handle`
    /// is the flow currently sending — cancelling a queued-but-not-sending
    /// flow is meaningless, since there is no in-flight output send to
    /// cancel, and is a silent no-op rather than an error.
    pub fn flow_request_cancel(&self, handle: &FlowHandle) {
        let Some(queue_rc) = handle.queue.upgrade() else {
            return;
        };
        let queue = queue_rc.borrow();
        debug_assert!(
            queue.use_cancel,
            "FairQueue::flow_request_cancel: use_cancel disabled at construction"
        );
        debug_assert!(
            !queue.freeing,
            "FairQueue::flow_request_cancel: queue is freeing"
        );
        let busy = queue
            .flows
            .get(&handle.id)
            .map(|f| f.is_busy(queue.sending, handle.id))
            .unwrap_or(false);
        debug_assert!(busy, "FairQueue::flow_request_cancel: flow not busy");
        if queue.sending == Some(handle.id) {
            queue.output.request_cancel();
        }
    }

    /// Arm a one-shot callback that fires exactly once, the moment this
    /// flow next stops being busy (after its done edge, before it could be
    /// re-queued by a subsequent send).
    pub fn flow_set_busy_handler(&self, handle: &FlowHandle, cb: impl FnMut() + 'static) {
        let Some(queue_rc) = handle.queue.upgrade() else {
            return;
        };
        let mut queue = queue_rc.borrow_mut();
        if let Some(flow) = queue.flows.get_mut(&handle.id) {
            flow.busy_handler = Some(Box::new(cb));
        }
    }

    /// Enter the freeing state: subsequent `flow_free` calls succeed even on
    /// busy flows. The queue itself must not be driven with further I/O
    /// after this.
    pub fn prepare_free(&self) {
        let mut queue = self.inner.borrow_mut();
        queue.freeing = true;
        queue.schedule_job.unset();
    }
}

fn enqueue(queue: &mut QueueInner, id: FlowId, buf: Bytes, done: Done) {
    debug_assert!(!queue.freeing, "FairQueue: flow sent after prepare_free");
    let cost = buf.len() as u64 + queue.packet_weight;

    let current_vt = queue.flows.get(&id).map(|f| f.vt).unwrap_or(0);
    if current_vt.checked_add(cost).map_or(true, |v| v > FAIRQUEUE_MAX_TIME) {
        rebase(queue);
    }

    let seq = queue.next_seq;
    queue.next_seq += 1;

    let flow = queue
        .flows
        .get_mut(&id)
        .expect("FairQueue: send on a detached flow");
    flow.vt = flow.vt.checked_add(cost).expect(
        "fair queue virtual-time overflow even after rebase: packet_weight/mtu configuration error",
    );
    debug_assert!(flow.vt <= FAIRQUEUE_MAX_TIME);
    flow.queued = true;
    flow.payload = Some(buf);
    flow.send_done = Some(done);

    queue.heap.push(Reverse(HeapEntry {
        vt: flow.vt,
        seq,
        flow_id: id,
    }));

    if queue.sending.is_none() {
        queue.schedule_job.set();
    }
}

/// Subtract the minimum vt across all attached flows from every flow (and
/// rebuild the heap's cached keys to match) so a subsequent `checked_add`
/// has room. Uniform subtraction preserves relative order; rebuilding the
/// heap is necessary because its keys are a snapshot taken at insertion
/// time, not a live view of `flow.vt`.
fn rebase(queue: &mut QueueInner) {
    let min_vt = queue.flows.values().map(|f| f.vt).min().unwrap_or(0);
    if min_vt == 0 {
        return;
    }
    for flow in queue.flows.values_mut() {
        flow.vt -= min_vt;
    }

    let stale = std::mem::take(&mut queue.heap);
    for Reverse(entry) in stale {
        if let Some(flow) = queue.flows.get(&entry.flow_id) {
            queue.heap.push(Reverse(HeapEntry {
                vt: flow.vt,
                seq: entry.seq,
                flow_id: entry.flow_id,
            }));
        }
    }

    tracing::debug!(min_vt, "fair queue rebased virtual time");
}

fn run_scheduler(queue_rc: &Rc<RefCell<QueueInner>>) {
    let dispatch = {
        let mut queue = queue_rc.borrow_mut();
        if queue.freeing || queue.sending.is_some() || !queue.output.is_idle() {
            None
        } else {
            let mut next = None;
            while let Some(Reverse(entry)) = queue.heap.pop() {
                if queue.flows.contains_key(&entry.flow_id) {
                    next = Some(entry.flow_id);
                    break;
                }
                // stale entry for a flow freed while queued: discard and keep popping
            }
            next.map(|flow_id| {
                let flow = queue
                    .flows
                    .get_mut(&flow_id)
                    .expect("flow vanished between lookup and dispatch");
                flow.queued = false;
                let payload = flow
                    .payload
                    .take()
                    .expect("queued flow missing its buffered payload");
                queue.sending = Some(flow_id);
                queue.in_flight_len = payload.len();
                (payload, queue.output.clone())
            })
        }
    };
    if let Some((payload, output)) = dispatch {
        output.send(payload);
    }
}

fn on_output_done(queue_rc: &Rc<RefCell<QueueInner>>) {
    let (send_done, busy_cb) = {
        let mut queue = queue_rc.borrow_mut();
        let flow_id = queue
            .sending
            .take()
            .expect("output done fired with no sending flow");
        queue.prev_sent = Some(flow_id);
        let mut flow = queue.flows.get_mut(&flow_id);
        let send_done = flow.as_deref_mut().and_then(|f| f.send_done.take());
        let busy_cb = flow.and_then(|f| f.busy_handler.take());
        queue.schedule_job.set();
        (send_done, busy_cb)
    };
    // Free the flow's own input channel before notifying the busy handler:
    // a busy-handler callback is allowed to immediately send the flow's
    // next packet (that's the point of "before any re-queue" in the
    // contract), which requires the channel to already be idle.
    if let Some(done) = send_done {
        done.signal();
    }
    if let Some(mut cb) = busy_cb {
        cb();
    }
}
