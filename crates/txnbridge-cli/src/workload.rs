//! Workload files
//!
//! A workload is a list of explicit packets and/or a seeded random traffic
//! generator. Both produce `(packet, arrival offset)` pairs for the runner.

use std::path::Path;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use txnbridge_core::{AccessMode, Packet, PacketCommand, RequestorId};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Workload Description
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One explicit packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketEntry {
    /// Packet id; the position in the list when absent
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub at_ns: u64,
    pub origin: RequestorId,
    pub command: PacketCommand,
    pub address: u64,
    /// Bytes to read
    #[serde(default)]
    pub length: Option<usize>,
    /// Hex payload for writes
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub mode: AccessMode,
    #[serde(default)]
    pub payload_delay_ns: u64,
}

/// Seeded random timed traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomTraffic {
    pub seed: u64,
    pub count: usize,
    /// Requestor ids to draw from
    pub origins: Vec<RequestorId>,
    pub base: u64,
    pub span: u64,
    pub max_length: usize,
    /// Arrivals are spread over `[0, window_ns)`
    pub window_ns: u64,
    pub write_ratio: f64,
    pub invalidate_ratio: f64,
}

impl Default for RandomTraffic {
    fn default() -> Self {
        Self {
            seed: 42,
            count: 100,
            origins: vec![0, 1, 2],
            base: 0x8000_0000,
            span: 0x1000,
            max_length: 8,
            window_ns: 1_000,
            write_ratio: 0.5,
            invalidate_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub metadata: WorkloadMetadata,
    #[serde(default)]
    pub packets: Vec<PacketEntry>,
    #[serde(default)]
    pub random: Option<RandomTraffic>,
}

/// Deterministic random source for traffic generation
pub struct SeededRandom {
    rng: StdRng,
    seed: u64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

// ----------------------------------------------------------------------------
// Packet Generation
// ----------------------------------------------------------------------------

impl Workload {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let workload: Workload = toml::from_str(text)?;
        workload.validate()?;
        Ok(workload)
    }

    /// Small mixed workload for `sample-config --workload`
    pub fn sample() -> Self {
        Self {
            metadata: WorkloadMetadata {
                name: "sample".to_string(),
                description: "two explicit accesses followed by random traffic".to_string(),
            },
            packets: vec![
                PacketEntry {
                    id: None,
                    at_ns: 0,
                    origin: 1,
                    command: PacketCommand::Write,
                    address: 0x8000_0000,
                    length: None,
                    data: Some("deadbeef".to_string()),
                    mode: AccessMode::Timed,
                    payload_delay_ns: 0,
                },
                PacketEntry {
                    id: None,
                    at_ns: 5,
                    origin: 0,
                    command: PacketCommand::Read,
                    address: 0x8000_0000,
                    length: Some(4),
                    data: None,
                    mode: AccessMode::Debug,
                    payload_delay_ns: 0,
                },
            ],
            random: Some(RandomTraffic::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.packets.iter().enumerate() {
            match entry.command {
                PacketCommand::Write if entry.data.is_none() => {
                    return Err(CliError::Workload(format!("packet {i}: write without data")));
                }
                PacketCommand::Read if entry.length.unwrap_or(0) == 0 => {
                    return Err(CliError::Workload(format!("packet {i}: read without length")));
                }
                _ => {}
            }
        }

        if let Some(random) = &self.random {
            if random.origins.is_empty() {
                return Err(CliError::Workload("random traffic needs origins".to_string()));
            }
            if random.max_length == 0 || random.span < random.max_length as u64 {
                return Err(CliError::Workload(
                    "random traffic span must hold the longest access".to_string(),
                ));
            }
            let ratios = random.write_ratio + random.invalidate_ratio;
            if !(0.0..=1.0).contains(&random.write_ratio)
                || !(0.0..=1.0).contains(&random.invalidate_ratio)
                || ratios > 1.0
            {
                return Err(CliError::Workload(
                    "random traffic ratios must lie in [0, 1] and sum to at most 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Every packet with its arrival offset; `seed` overrides the random seed
    pub fn packets(&self, seed: Option<u64>) -> Result<Vec<(Packet, Duration)>> {
        let mut packets = Vec::with_capacity(self.packets.len());
        for (i, entry) in self.packets.iter().enumerate() {
            let id = entry.id.unwrap_or(i as u64);
            packets.push((entry.to_packet(id)?, Duration::from_nanos(entry.at_ns)));
        }

        if let Some(random) = &self.random {
            let mut rng = SeededRandom::new(seed.unwrap_or(random.seed));
            info!(
                "generating {} random packets with seed {}",
                random.count,
                rng.seed()
            );
            let first_id = packets.len() as u64;
            packets.extend(random.generate(&mut rng, first_id));
        }
        Ok(packets)
    }
}

impl PacketEntry {
    fn to_packet(&self, id: u64) -> Result<Packet> {
        let packet = match self.command {
            PacketCommand::Read => {
                Packet::read(id, self.origin, self.address, self.length.unwrap_or(0))
            }
            PacketCommand::Write => {
                let data = hex::decode(self.data.as_deref().unwrap_or_default())?;
                Packet::write(id, self.origin, self.address, data)
            }
            PacketCommand::Invalidate => Packet::invalidate(id, self.origin, self.address),
        };
        Ok(packet
            .with_mode(self.mode)
            .with_payload_delay(Duration::from_nanos(self.payload_delay_ns)))
    }
}

impl RandomTraffic {
    fn generate(&self, rng: &mut SeededRandom, first_id: u64) -> Vec<(Packet, Duration)> {
        (0..self.count as u64)
            .map(|n| {
                let id = first_id + n;
                let origin = self.origins[rng.rng.gen_range(0..self.origins.len())];
                let length = rng.rng.gen_range(1..=self.max_length);
                let address = self.base + rng.rng.gen_range(0..=self.span - length as u64);
                let roll: f64 = rng.rng.gen();
                let packet = if roll < self.invalidate_ratio {
                    Packet::invalidate(id, origin, address)
                } else if roll < self.invalidate_ratio + self.write_ratio {
                    let data = (0..length).map(|_| rng.rng.gen()).collect();
                    Packet::write(id, origin, address, data)
                } else {
                    Packet::read(id, origin, address, length)
                };
                let at = Duration::from_nanos(rng.rng.gen_range(0..self.window_ns.max(1)));
                (packet, at)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_packets_parse() {
        let text = r#"
            [[packets]]
            origin = 1
            command = "write"
            address = 0x80000010
            data = "0102"

            [[packets]]
            at_ns = 20
            origin = 0
            command = "read"
            address = 0x80000010
            length = 2
            mode = "atomic"
        "#;
        let workload = Workload::from_toml(text).unwrap();
        let packets = workload.packets(None).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0.data, vec![1, 2]);
        assert_eq!(packets[1].0.mode, AccessMode::Atomic);
        assert_eq!(packets[1].1, Duration::from_nanos(20));
    }

    #[test]
    fn test_write_without_data_rejected() {
        let text = r#"
            [[packets]]
            origin = 1
            command = "write"
            address = 0x0
        "#;
        assert!(matches!(
            Workload::from_toml(text),
            Err(CliError::Workload(_))
        ));
    }

    #[test]
    fn test_random_traffic_is_reproducible() {
        let workload = Workload {
            random: Some(RandomTraffic::default()),
            ..Workload::default()
        };
        let first = workload.packets(None).unwrap();
        let second = workload.packets(None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 100);

        let reseeded = workload.packets(Some(7)).unwrap();
        assert_ne!(first, reseeded);
    }

    #[test]
    fn test_random_addresses_stay_in_span() {
        let traffic = RandomTraffic {
            count: 500,
            ..RandomTraffic::default()
        };
        let mut rng = SeededRandom::new(3);
        for (packet, at) in traffic.generate(&mut rng, 0) {
            assert!(packet.address >= traffic.base);
            let end = packet.address + packet.data.len() as u64;
            assert!(end <= traffic.base + traffic.span);
            assert!(at < Duration::from_nanos(traffic.window_ns));
        }
    }

    #[test]
    fn test_sample_round_trips() {
        let text = Workload::sample().to_toml().unwrap();
        let workload = Workload::from_toml(&text).unwrap();
        assert_eq!(workload.packets.len(), 2);
        assert!(workload.random.is_some());
    }
}
