use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use vpn_common::config::{FairQueueParams, SpParams};
use vpn_demo::pipeline::{Demo, DemoConfig};
use vpn_demo::scenario::{FlowTrafficConfig, TrafficConfig, TrafficGenerator};
use vpn_secproto::crypto::EncryptionKey;
use vpn_secproto::encode::encode_frame;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let mut args = std::env::args().skip(1);
    let mut seed = 1u64;
    let mut num_flows = 3usize;
    let mut packets_per_flow = 50usize;
    let mut encrypt = false;
    let mut hash = false;
    let mut otp = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seed" => seed = args.next().expect("missing --seed value").parse()?,
            "--flows" => num_flows = args.next().expect("missing --flows value").parse()?,
            "--packets" => packets_per_flow = args.next().expect("missing --packets value").parse()?,
            "--encrypt" => encrypt = true,
            "--hash" => hash = true,
            "--otp" => otp = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let sp_params = SpParams {
        encryption_enabled: encrypt,
        block_size: 16,
        hash_enabled: hash,
        hash_size: 16,
        otp_enabled: otp,
    };

    let cfg = DemoConfig {
        sp_params,
        fq_params: FairQueueParams::default(),
        num_otp_seeds: 2,
        worker_threads: 2,
        payload_mtu: 1400,
    };

    let mut demo = Demo::new(&cfg)?;
    let key = (encrypt || hash).then(|| EncryptionKey { key: [0x42u8; 16] });
    if let Some(key) = &key {
        demo.decoder.set_encryption_key(key.key);
    }
    if otp {
        demo.decoder.add_otp_seed(1, b"demo-otp-key".to_vec(), b"demo-otp-iv".to_vec());
    }

    let mut generator = TrafficGenerator::new(TrafficConfig {
        seed,
        packets_per_flow,
        flows: (0..num_flows)
            .map(|_| FlowTrafficConfig { min_len: 64, max_len: 1200 })
            .collect(),
    });
    let traffic = generator.generate();
    let handles: Vec<_> = (0..num_flows).map(|_| demo.add_flow()).collect();

    // Each flow continuously offers its next queued packet the instant its
    // channel frees up — the same "continuous offer" pattern vpn-fairqueue's
    // own tests use to drive fairness checks, reused here to drain a fixed
    // traffic set instead of an unbounded one.
    let sent_counts: Vec<Rc<RefCell<usize>>> = (0..num_flows).map(|_| Rc::new(RefCell::new(0))).collect();
    let otp_counter = Rc::new(RefCell::new(0u16));

    for (flow_idx, handle) in handles.iter().enumerate() {
        let packets = traffic[flow_idx].clone();
        let sent = sent_counts[flow_idx].clone();
        let key = key.clone();
        let otp_counter = otp_counter.clone();
        let handle_for_handler = handle.clone();
        demo.queue.flow_set_busy_handler(handle, move || {
            let idx = *sent.borrow();
            if idx >= packets.len() {
                return;
            }
            *sent.borrow_mut() += 1;
            let otp_pair = if otp {
                let mut c = otp_counter.borrow_mut();
                let value = *c;
                *c += 1;
                Some((1u16, value))
            } else {
                None
            };
            let frame = encode_frame(&packets[idx], &sp_params, key.as_ref(), [0x11u8; 16], otp_pair);
            if let Some(input) = handle_for_handler.input() {
                input.send(frame);
            }
        });
    }

    // Kick off the first packet on every flow; the busy handlers above take
    // it from there.
    for (flow_idx, handle) in handles.iter().enumerate() {
        *sent_counts[flow_idx].borrow_mut() = 1;
        let mut otp_pair = None;
        if otp {
            let mut c = otp_counter.borrow_mut();
            otp_pair = Some((1u16, *c));
            *c += 1;
        }
        let frame = encode_frame(&traffic[flow_idx][0], &sp_params, key.as_ref(), [0x11u8; 16], otp_pair);
        if let Some(input) = handle.input() {
            input.send(frame);
        }
    }

    for _ in 0..packets_per_flow * 4 {
        demo.pump();
    }

    let total_decoded = demo.sink.received.borrow().len();
    let total_bytes: usize = demo.sink.received.borrow().iter().map(|b| b.len()).sum();
    let stats = serde_json::json!({
        "flows": num_flows,
        "packets_per_flow": packets_per_flow,
        "decoded_packets": total_decoded,
        "decoded_bytes": total_bytes,
        "encryption_enabled": encrypt,
        "hash_enabled": hash,
        "otp_enabled": otp,
    });
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
