//! Wires a [`FairQueue`] in front of a [`Decoder`] over one in-memory
//! carrier, matching how a real deployment chains "many flows -> one fair
//! queue -> one secure-protocol decoder -> the application". Assembles a
//! runtime purely from the two crates' public types rather than
//! reimplementing any of their logic here.

use std::rc::Rc;

use bytes::Bytes;
use vpn_common::config::{FairQueueParams, SpParams};
use vpn_fairqueue::{FairQueue, FlowHandle};
use vpn_pass::test_util::RecordingSink;
use vpn_pass::JobQueue;
use vpn_secproto::crypto::EncryptionKey;
use vpn_secproto::encode::encode_frame;
use vpn_secproto::worker::{ThreadWorkerPool, WorkerPool};
use vpn_secproto::Decoder;

/// Everything needed to construct one [`Demo`] pipeline.
#[derive(Debug, Clone, Copy)]
pub struct DemoConfig {
    pub sp_params: SpParams,
    pub fq_params: FairQueueParams,
    pub num_otp_seeds: usize,
    pub worker_threads: usize,
    pub payload_mtu: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            sp_params: SpParams::default(),
            fq_params: FairQueueParams::default(),
            num_otp_seeds: 2,
            worker_threads: 2,
            payload_mtu: 1400,
        }
    }
}

/// One assembled demo run: N flows feeding a fair queue, whose output is
/// the decoder's carrier input, whose decoded plaintext lands in `sink`.
pub struct Demo {
    pub jobs: JobQueue,
    pub queue: FairQueue,
    pub decoder: Decoder,
    pub sink: RecordingSink,
    sp_params: SpParams,
    flows: Vec<FlowHandle>,
}

impl Demo {
    pub fn new(cfg: &DemoConfig) -> anyhow::Result<Self> {
        let jobs = JobQueue::new();
        let (output, sink) = RecordingSink::new(cfg.payload_mtu, &jobs, true);
        let pool: Rc<dyn WorkerPool> = Rc::new(ThreadWorkerPool::new(cfg.worker_threads.max(1)));
        let decoder = Decoder::new(output, &jobs, cfg.sp_params, cfg.num_otp_seeds, pool)?;
        let queue = FairQueue::new(decoder.input(), &jobs, cfg.fq_params)?;
        Ok(Demo {
            jobs,
            queue,
            decoder,
            sink,
            sp_params: cfg.sp_params,
            flows: Vec::new(),
        })
    }

    /// Attach a new producer-facing flow, returning its handle.
    pub fn add_flow(&mut self) -> FlowHandle {
        let handle = self.queue.flow_init();
        self.flows.push(handle.clone());
        handle
    }

    pub fn flows(&self) -> &[FlowHandle] {
        &self.flows
    }

    /// Encode `payload` into an SPProto frame per this pipeline's
    /// negotiated parameters, then push it through `handle`'s input.
    pub fn send(
        &self,
        handle: &FlowHandle,
        payload: &[u8],
        key: Option<&EncryptionKey>,
        iv: [u8; 16],
        otp: Option<(u16, u16)>,
    ) {
        let frame: Bytes = encode_frame(payload, &self.sp_params, key, iv, otp);
        if let Some(input) = handle.input() {
            input.send(frame);
        }
    }

    /// Drain every pending job and worker-pool completion. Bounded so a
    /// stuck pipeline (a bug, not expected in normal operation) cannot spin
    /// forever; in practice a handful of hops always suffices.
    pub fn pump(&self) {
        for _ in 0..256 {
            self.jobs.run();
            self.decoder.pump_worker_pool();
        }
    }
}
