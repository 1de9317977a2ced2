//! Flow bookkeeping. A flow's data lives inside its owning queue's table —
//! never shared-owned by the handle the caller holds — per the "back
//! reference is non-owning" design note: model it as an index into a
//! queue-owned table, not as an `Rc` cycle.

use std::rc::{Rc, Weak};

use bytes::Bytes;
use vpn_pass::{Done, PacketPass};

use crate::QueueInner;

/// Identifies one flow within its queue's flow table. Cheap to copy, not
/// meaningful across different queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub(crate) u64);

/// A handle to a flow attached to a [`crate::FairQueue`]. Holds only a weak
/// reference to the owning queue plus an id — the flow's state is never
/// reachable except through the queue, so a dangling handle (queue dropped,
/// or flow freed) is simply inert rather than unsafe.
#[derive(Clone)]
pub struct FlowHandle {
    pub(crate) id: FlowId,
    pub(crate) queue: Weak<std::cell::RefCell<QueueInner>>,
}

impl FlowHandle {
    /// The push channel the producer sends packets into. `None` if the
    /// owning queue has since been dropped.
    pub fn input(&self) -> Option<Rc<PacketPass>> {
        let queue = self.queue.upgrade()?;
        let queue = queue.borrow();
        queue.flows.get(&self.id).map(|flow| flow.input.clone())
    }
}

pub(crate) struct FlowInner {
    pub vt: u64,
    pub queued: bool,
    pub payload: Option<Bytes>,
    pub send_done: Option<Done>,
    pub busy_handler: Option<Box<dyn FnMut()>>,
    pub input: Rc<PacketPass>,
}

impl FlowInner {
    pub fn is_busy(&self, sending: Option<FlowId>, id: FlowId) -> bool {
        self.queued || sending == Some(id)
    }
}
