//! System description
//!
//! Describes the memory, the secondary fabric and its device windows, the
//! source table, the routing nodes and how sources bind to them. Loaded from
//! TOML by the CLI; presets cover the common layouts.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapter::{BindingMode, BoundaryAdapter, Upstream};
use crate::errors::{BridgeError, ConfigError, Result};
use crate::packet::{RequestorId, SourceGroup, SourceMap};
use crate::router::{NodeTiming, RouterNode};
use crate::simulation::Simulation;
use crate::target::{shared, AddressRange, SharedTarget, SimpleBus, SimpleMemory};

// ----------------------------------------------------------------------------
// Configuration Sections
// ----------------------------------------------------------------------------

/// Bytes written into memory before the run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preload {
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub read_only: bool,
    pub latency_ns: u64,
    pub preload: Vec<Preload>,
}

impl MemoryConfig {
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.base, self.size)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            base: 0x8000_0000,
            size: 0x1_0000,
            read_only: false,
            latency_ns: 0,
            preload: Vec::new(),
        }
    }
}

/// Extra window decoded by the secondary fabric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub base: u64,
    pub size: u64,
    #[serde(default)]
    pub latency_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub name: String,
    pub hop_latency_ns: u64,
    pub devices: Vec<DeviceConfig>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            hop_latency_ns: 0,
            devices: Vec::new(),
        }
    }
}

/// Final executor of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Direct link to the memory
    #[default]
    Local,
    /// Everything through the secondary fabric
    BusRelay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Range executed through the strategy; the memory range when absent
    #[serde(default)]
    pub memory_range: Option<AddressRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub accept_delay_ns: u64,
    pub execute_latency_ns: u64,
    pub response_delay_ns: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            accept_delay_ns: 10,
            execute_latency_ns: 15,
            response_delay_ns: 10,
        }
    }
}

impl From<TimingConfig> for NodeTiming {
    fn from(timing: TimingConfig) -> Self {
        Self {
            accept_delay: Duration::from_nanos(timing.accept_delay_ns),
            execute_latency: Duration::from_nanos(timing.execute_latency_ns),
            response_delay: Duration::from_nanos(timing.response_delay_ns),
        }
    }
}

// ----------------------------------------------------------------------------
// System Configuration
// ----------------------------------------------------------------------------

/// Complete description of a bridge system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub memory: MemoryConfig,
    pub fabric: FabricConfig,
    pub sources: Vec<SourceGroup>,
    pub nodes: Vec<NodeConfig>,
    pub binding: BindingMode,
    pub timing: TimingConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::multi_core(2)
    }
}

impl SystemConfig {
    /// One core sharing a single router with the system source
    pub fn single_core() -> Self {
        Self {
            memory: MemoryConfig::default(),
            fabric: FabricConfig::default(),
            sources: vec![SourceGroup {
                name: "cpu0".to_string(),
                requestors: vec![1],
            }],
            nodes: vec![NodeConfig {
                name: "router0".to_string(),
                strategy: StrategyKind::Local,
                memory_range: None,
            }],
            binding: BindingMode::Shared,
            timing: TimingConfig::default(),
        }
    }

    /// `cores` cores, each with its own router, and a bus wrapper for the
    /// system source
    pub fn multi_core(cores: usize) -> Self {
        let sources = (0..cores)
            .map(|i| SourceGroup {
                name: format!("cpu{i}"),
                requestors: vec![(i + 1) as RequestorId],
            })
            .collect();

        let mut nodes = vec![NodeConfig {
            name: "wrapper0".to_string(),
            strategy: StrategyKind::BusRelay,
            memory_range: None,
        }];
        nodes.extend((1..=cores).map(|i| NodeConfig {
            name: format!("router{i}"),
            strategy: StrategyKind::Local,
            memory_range: None,
        }));

        Self {
            memory: MemoryConfig::default(),
            fabric: FabricConfig {
                devices: vec![DeviceConfig {
                    name: "uart".to_string(),
                    base: 0x1000_0000,
                    size: 0x100,
                    latency_ns: 5,
                }],
                ..FabricConfig::default()
            },
            sources,
            nodes,
            binding: BindingMode::PerSource,
            timing: TimingConfig::default(),
        }
    }

    /// Parse a TOML description
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BridgeError::config_error(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BridgeError::config_error(e.to_string()))
    }

    /// Number of sources including the system source
    pub fn source_count(&self) -> usize {
        self.sources.len() + 1
    }

    /// Check the description for consistency
    pub fn validate(&self) -> Result<()> {
        if self.memory.size == 0 {
            return Err(BridgeError::config_error("memory size must be greater than 0"));
        }
        if self.memory.base.checked_add(self.memory.size).is_none() {
            return Err(BridgeError::config_error(
                "memory range wraps the address space",
            ));
        }
        if self.nodes.is_empty() {
            return Err(BridgeError::config_error("at least one node is required"));
        }
        if self.binding == BindingMode::PerSource && self.nodes.len() < self.source_count() {
            return Err(BridgeError::config_error(format!(
                "per-source binding needs {} nodes, {} configured",
                self.source_count(),
                self.nodes.len()
            )));
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|other| other.name == node.name) {
                return Err(BridgeError::config_error(format!(
                    "node name {} is used twice",
                    node.name
                )));
            }
        }

        let memory = self.memory.range();
        for preload in &self.memory.preload {
            if !memory.contains_span(preload.address, preload.data.len()) {
                return Err(BridgeError::config_error(format!(
                    "preload at {:#x} leaves memory {}",
                    preload.address, memory
                )));
            }
        }

        let mut windows = vec![memory];
        for device in &self.fabric.devices {
            if device.size == 0 {
                return Err(BridgeError::config_error(format!(
                    "device {} has no size",
                    device.name
                )));
            }
            let range = AddressRange::new(device.base, device.size);
            if let Some(existing) = windows.iter().find(|w| w.overlaps(&range)) {
                return Err(ConfigError::OverlappingRanges {
                    first: existing.to_string(),
                    second: range.to_string(),
                }
                .into());
            }
            windows.push(range);
        }

        self.source_map().map(|_| ())
    }

    fn source_map(&self) -> Result<SourceMap> {
        SourceMap::new(self.sources.clone())
    }

    /// Build the memory, the fabric and the nodes, wired to `upstream`
    pub fn build<U: Upstream>(&self, upstream: U) -> Result<Simulation<U>> {
        self.validate()?;

        let memory = self.build_memory()?;
        let fabric = self.build_fabric(&memory)?;
        let timing = NodeTiming::from(self.timing);
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let range = node.memory_range.unwrap_or(self.memory.range());
                info!("node {} ({:?}) executes {}", node.name, node.strategy, range);
                match node.strategy {
                    StrategyKind::Local => RouterNode::router(
                        node.name.clone(),
                        range,
                        memory.clone(),
                        fabric.clone(),
                        timing,
                    ),
                    StrategyKind::BusRelay => {
                        RouterNode::wrapper(node.name.clone(), range, fabric.clone(), timing)
                    }
                }
            })
            .collect();

        let sources = self.source_map()?;
        sources.log_table();
        let adapter = BoundaryAdapter::new("bridge", nodes, self.binding, sources, upstream);
        Ok(Simulation::new(adapter))
    }

    fn build_memory(&self) -> Result<SharedTarget> {
        let mut memory = SimpleMemory::new(self.memory.name.clone(), self.memory.range())
            .with_latency(Duration::from_nanos(self.memory.latency_ns))
            .read_only(self.memory.read_only);
        for preload in &self.memory.preload {
            memory.load(preload.address, &preload.data)?;
        }
        Ok(shared(memory))
    }

    fn build_fabric(&self, memory: &SharedTarget) -> Result<SharedTarget> {
        let mut bus = SimpleBus::new(self.fabric.name.clone())
            .with_hop_latency(Duration::from_nanos(self.fabric.hop_latency_ns));
        bus.map(self.memory.range(), memory.clone())?;
        for device in &self.fabric.devices {
            let range = AddressRange::new(device.base, device.size);
            let target = SimpleMemory::new(device.name.clone(), range)
                .with_latency(Duration::from_nanos(device.latency_ns));
            bus.map(range, shared(target))?;
        }
        for range in bus.ranges() {
            info!("{} decodes {}", self.fabric.name, range);
        }
        Ok(shared(bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initiator::RecordingInitiator;

    #[test]
    fn test_presets_validate() {
        SystemConfig::single_core().validate().unwrap();
        SystemConfig::multi_core(4).validate().unwrap();
        SystemConfig::default().validate().unwrap();
    }

    #[test]
    fn test_multi_core_layout() {
        let config = SystemConfig::multi_core(3);
        assert_eq!(config.source_count(), 4);
        assert_eq!(config.nodes.len(), 4);
        assert_eq!(config.nodes[0].strategy, StrategyKind::BusRelay);
        assert_eq!(config.binding, BindingMode::PerSource);
    }

    #[test]
    fn test_toml_round_trip_keeps_layout() {
        let config = SystemConfig::multi_core(2);
        let text = config.to_toml().unwrap();
        assert!(text.contains("bus-relay"));
        assert_eq!(SystemConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            binding = "shared"

            [memory]
            base = 0x1000
            size = 0x400

            [[sources]]
            name = "dma"
            requestors = [12, 13]

            [[nodes]]
            name = "solo"
        "#;
        let config = SystemConfig::from_toml(text).unwrap();
        assert_eq!(config.memory.base, 0x1000);
        assert_eq!(config.memory.name, "memory");
        assert_eq!(config.nodes[0].strategy, StrategyKind::Local);
        assert_eq!(config.timing, TimingConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_per_source_binding_needs_enough_nodes() {
        let mut config = SystemConfig::multi_core(2);
        config.nodes.pop();
        assert_eq!(config.validate().unwrap_err().reason(), "configuration");
    }

    #[test]
    fn test_overlapping_device_rejected() {
        let mut config = SystemConfig::single_core();
        config.fabric.devices.push(DeviceConfig {
            name: "shadow".to_string(),
            base: config.memory.base + 0x10,
            size: 0x10,
            latency_ns: 0,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_preload_outside_memory_rejected() {
        let mut config = SystemConfig::single_core();
        config.memory.preload.push(Preload {
            address: 0x10,
            data: vec![1],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_wires_nodes() {
        let simulation = SystemConfig::multi_core(2)
            .build(RecordingInitiator::new())
            .unwrap();
        let names: Vec<_> = simulation
            .adapter()
            .nodes()
            .iter()
            .map(|node| (node.name(), node.strategy()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("wrapper0", "bus-relay"),
                ("router1", "local"),
                ("router2", "local")
            ]
        );
        assert_eq!(simulation.adapter().coordinator().source_count(), 3);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_build_logs_source_table_once() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let config = SystemConfig::multi_core(2);
            config.validate().unwrap();
            config.build(RecordingInitiator::new()).unwrap();
        });

        let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(log.matches("(cpu0) <- requestors").count(), 1);
        assert_eq!(log.matches("(cpu1) <- requestors").count(), 1);
    }
}
