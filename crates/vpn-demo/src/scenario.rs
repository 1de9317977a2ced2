//! Deterministic synthetic traffic generator: produces reproducible
//! payload sequences for a fixed number of flows, the inputs this demo's
//! pipeline needs to exercise the fair queue and decoder end to end.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

/// Bounds for one flow's synthetic payloads.
#[derive(Debug, Clone)]
pub struct FlowTrafficConfig {
    pub min_len: usize,
    pub max_len: usize,
}

/// Configuration for a deterministic multi-flow traffic scenario.
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    pub seed: u64,
    pub packets_per_flow: usize,
    pub flows: Vec<FlowTrafficConfig>,
}

/// Produces one reproducible payload sequence per flow, seeded once at
/// construction so re-running with the same config yields byte-identical
/// output.
pub struct TrafficGenerator {
    rng: StdRng,
    cfg: TrafficConfig,
}

impl TrafficGenerator {
    pub fn new(cfg: TrafficConfig) -> Self {
        TrafficGenerator {
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
        }
    }

    /// All packets for every flow, in generation order per flow. The
    /// pipeline is responsible for interleaving delivery across flows.
    pub fn generate(&mut self) -> Vec<Vec<Bytes>> {
        self.cfg
            .flows
            .iter()
            .enumerate()
            .map(|(flow_idx, flow_cfg)| {
                (0..self.cfg.packets_per_flow)
                    .map(|pkt_idx| {
                        let len = if flow_cfg.max_len > flow_cfg.min_len {
                            flow_cfg.min_len
                                + self.rng.random_range(0..(flow_cfg.max_len - flow_cfg.min_len))
                        } else {
                            flow_cfg.min_len
                        };
                        // Tag each payload with its flow/packet index so the
                        // demo can report delivery order without needing
                        // random content.
                        let mut data = vec![flow_idx as u8; len];
                        if !data.is_empty() {
                            data[0] = pkt_idx as u8;
                        }
                        Bytes::from(data)
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TrafficConfig {
        TrafficConfig {
            seed: 7,
            packets_per_flow: 20,
            flows: vec![
                FlowTrafficConfig { min_len: 10, max_len: 200 },
                FlowTrafficConfig { min_len: 50, max_len: 500 },
            ],
        }
    }

    #[test]
    fn generation_is_deterministic_for_seed() {
        let mut g1 = TrafficGenerator::new(cfg());
        let mut g2 = TrafficGenerator::new(cfg());
        assert_eq!(g1.generate(), g2.generate());
    }

    #[test]
    fn respects_per_flow_length_bounds() {
        let mut g = TrafficGenerator::new(cfg());
        let packets = g.generate();
        for (flow_idx, flow_packets) in packets.iter().enumerate() {
            let bounds = &cfg().flows[flow_idx];
            for pkt in flow_packets {
                assert!(pkt.len() >= bounds.min_len && pkt.len() < bounds.max_len.max(bounds.min_len + 1));
            }
        }
    }
}
