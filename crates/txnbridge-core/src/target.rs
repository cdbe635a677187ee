//! Downstream targets: the memory backend and the secondary bus
//!
//! Targets execute a transaction synchronously and report the latency they
//! add. They sit behind a [`SharedTarget`] because several routing nodes (and
//! the bus) reach the same memory; the mutex is the memory's access latch.

use core::fmt;
use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{BridgeError, ConfigError, Result, RoutingError, TargetError};
use crate::transaction::{Command, ResponseStatus, Transaction};

// ----------------------------------------------------------------------------
// Address Ranges
// ----------------------------------------------------------------------------

/// Half-open address window `[base, base + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
}

impl AddressRange {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// One past the last address
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether the whole access `[address, address + length)` fits
    pub fn contains_span(&self, address: u64, length: usize) -> bool {
        self.contains(address) && address.saturating_add(length as u64) <= self.end()
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base, self.end())
    }
}

// ----------------------------------------------------------------------------
// Target Trait
// ----------------------------------------------------------------------------

/// Synchronous executor at the bottom of a route
pub trait Target {
    /// Component name used in diagnostics
    fn name(&self) -> &str;

    /// Whether this target owns the address
    fn decodes(&self, address: u64) -> bool;

    /// Execute the transaction, set its status and return the latency added
    fn transport(&mut self, txn: &mut Transaction) -> Result<Duration>;

    /// Inspection access without timing; returns the number of bytes moved
    fn transport_dbg(&mut self, txn: &mut Transaction) -> Result<usize>;
}

/// A target reachable from several components
pub type SharedTarget = Arc<Mutex<dyn Target + Send>>;

/// Wrap a concrete target for sharing
pub fn shared<T: Target + Send + 'static>(target: T) -> SharedTarget {
    Arc::new(Mutex::new(target))
}

/// Take a target's access latch
pub fn lock(target: &SharedTarget) -> Result<MutexGuard<'_, dyn Target + Send + 'static>> {
    target.lock().map_err(|poisoned| {
        BridgeError::from(TargetError::LatchPoisoned {
            target: poisoned.get_ref().name().to_string(),
        })
    })
}

// ----------------------------------------------------------------------------
// Simple Memory
// ----------------------------------------------------------------------------

/// Flat byte-addressed memory
pub struct SimpleMemory {
    name: String,
    range: AddressRange,
    data: Vec<u8>,
    read_only: bool,
    access_latency: Duration,
    accesses: u64,
}

impl SimpleMemory {
    pub fn new<N: Into<String>>(name: N, range: AddressRange) -> Self {
        Self {
            name: name.into(),
            range,
            data: vec![0; range.size as usize],
            read_only: false,
            access_latency: Duration::ZERO,
            accesses: 0,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.access_latency = latency;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Number of timed or atomic accesses served
    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    /// Preload bytes at an absolute address, ignoring the read-only flag
    pub fn load(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let offset = self.offset(address, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy out `length` bytes at an absolute address
    pub fn peek(&self, address: u64, length: usize) -> Result<&[u8]> {
        let offset = self.offset(address, length)?;
        Ok(&self.data[offset..offset + length])
    }

    fn offset(&self, address: u64, length: usize) -> Result<usize> {
        if !self.range.contains_span(address, length) {
            return Err(TargetError::AccessOutOfBounds {
                target: self.name.clone(),
                address,
                length,
                base: self.range.base,
                end: self.range.end(),
            }
            .into());
        }
        Ok((address - self.range.base) as usize)
    }

    fn access(&mut self, txn: &mut Transaction) -> Result<usize> {
        let length = txn.data_length();
        let offset = self.offset(txn.address(), length)?;
        match txn.command() {
            Command::Read => {
                txn.data_mut()
                    .copy_from_slice(&self.data[offset..offset + length]);
            }
            Command::Write => {
                if self.read_only {
                    return Err(TargetError::ReadOnly {
                        target: self.name.clone(),
                        address: txn.address(),
                    }
                    .into());
                }
                self.data[offset..offset + length].copy_from_slice(txn.data());
            }
            Command::Ignore => {
                return Err(RoutingError::UnsupportedCommand {
                    command: txn.command().to_string(),
                    mode: "memory".into(),
                }
                .into());
            }
        }
        Ok(length)
    }
}

impl Target for SimpleMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn decodes(&self, address: u64) -> bool {
        self.range.contains(address)
    }

    fn transport(&mut self, txn: &mut Transaction) -> Result<Duration> {
        self.access(txn)?;
        self.accesses += 1;
        txn.set_status(ResponseStatus::Ok);
        trace!(
            "{}: {} {} bytes at {:#x}",
            self.name,
            txn.command(),
            txn.data_length(),
            txn.address()
        );
        Ok(self.access_latency)
    }

    fn transport_dbg(&mut self, txn: &mut Transaction) -> Result<usize> {
        self.access(txn)
    }
}

// ----------------------------------------------------------------------------
// Simple Bus
// ----------------------------------------------------------------------------

/// One decoded window of the bus
pub struct PortMapping {
    pub range: AddressRange,
    pub target: SharedTarget,
}

/// Secondary fabric: forwards each transaction to the target owning its address
pub struct SimpleBus {
    name: String,
    mappings: Vec<PortMapping>,
    hop_latency: Duration,
}

impl SimpleBus {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            mappings: Vec::new(),
            hop_latency: Duration::ZERO,
        }
    }

    pub fn with_hop_latency(mut self, latency: Duration) -> Self {
        self.hop_latency = latency;
        self
    }

    /// Add a window; overlapping windows are a configuration error
    pub fn map(&mut self, range: AddressRange, target: SharedTarget) -> Result<()> {
        if let Some(existing) = self.mappings.iter().find(|m| m.range.overlaps(&range)) {
            return Err(ConfigError::OverlappingRanges {
                first: existing.range.to_string(),
                second: range.to_string(),
            }
            .into());
        }
        self.mappings.push(PortMapping { range, target });
        Ok(())
    }

    pub fn ranges(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.mappings.iter().map(|m| m.range)
    }

    fn route(&self, address: u64) -> Result<&SharedTarget> {
        self.mappings
            .iter()
            .find(|m| m.range.contains(address))
            .map(|m| &m.target)
            .ok_or_else(|| BridgeError::out_of_range(self.name.clone(), address, None))
    }
}

impl Target for SimpleBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn decodes(&self, address: u64) -> bool {
        self.mappings.iter().any(|m| m.range.contains(address))
    }

    fn transport(&mut self, txn: &mut Transaction) -> Result<Duration> {
        let target = self.route(txn.address())?;
        let latency = lock(target)?.transport(txn)?;
        Ok(self.hop_latency + latency)
    }

    fn transport_dbg(&mut self, txn: &mut Transaction) -> Result<usize> {
        let target = self.route(txn.address())?;
        let moved = lock(target)?.transport_dbg(txn)?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SourceId;

    fn write(address: u64, data: &[u8]) -> Transaction {
        Transaction::new(Command::Write, address, data.to_vec(), SourceId::new(1))
    }

    fn read(address: u64, length: usize) -> Transaction {
        Transaction::new(Command::Read, address, vec![0; length], SourceId::new(1))
    }

    #[test]
    fn test_range_contains() {
        let range = AddressRange::new(0x1000, 0x100);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x10ff));
        assert!(!range.contains(0x1100));
        assert!(!range.contains(0xfff));
        assert!(range.contains_span(0x10fc, 4));
        assert!(!range.contains_span(0x10fd, 4));
        assert!(range.overlaps(&AddressRange::new(0x10f0, 0x100)));
        assert!(!range.overlaps(&AddressRange::new(0x1100, 0x100)));
    }

    #[test]
    fn test_memory_write_then_read() {
        let mut memory = SimpleMemory::new("mem", AddressRange::new(0x8000, 0x100))
            .with_latency(Duration::from_nanos(10));
        let mut w = write(0x8010, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(memory.transport(&mut w).unwrap(), Duration::from_nanos(10));
        assert!(w.status().is_ok());

        let mut r = read(0x8010, 4);
        memory.transport(&mut r).unwrap();
        assert_eq!(r.data(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(memory.accesses(), 2);
    }

    #[test]
    fn test_memory_bounds_are_fatal() {
        let mut memory = SimpleMemory::new("mem", AddressRange::new(0x0, 0x10));
        let mut r = read(0xe, 4);
        let err = memory.transport(&mut r).unwrap_err();
        assert_eq!(err.reason(), "memory-access");
        assert_eq!(r.status(), ResponseStatus::Incomplete);
    }

    #[test]
    fn test_read_only_memory_rejects_writes() {
        let mut memory = SimpleMemory::new("rom", AddressRange::new(0x0, 0x10)).read_only(true);
        memory.load(0x0, &[7, 7]).unwrap();
        let mut w = write(0x0, &[1]);
        assert!(memory.transport(&mut w).is_err());
        assert_eq!(memory.peek(0x0, 2).unwrap(), &[7, 7]);
    }

    #[test]
    fn test_debug_transport_moves_bytes_without_counting() {
        let mut memory = SimpleMemory::new("mem", AddressRange::new(0x0, 0x10));
        let mut w = write(0x4, &[1, 2, 3]);
        assert_eq!(memory.transport_dbg(&mut w).unwrap(), 3);
        assert_eq!(memory.accesses(), 0);
        assert_eq!(w.status(), ResponseStatus::Incomplete);
        assert_eq!(memory.peek(0x4, 3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_bus_routes_by_window() {
        let low = shared(SimpleMemory::new("low", AddressRange::new(0x0, 0x100)));
        let high = shared(SimpleMemory::new("high", AddressRange::new(0x1000, 0x100)));
        let mut bus = SimpleBus::new("bus").with_hop_latency(Duration::from_nanos(2));
        bus.map(AddressRange::new(0x0, 0x100), low.clone()).unwrap();
        bus.map(AddressRange::new(0x1000, 0x100), high).unwrap();

        let mut w = write(0x20, &[9]);
        assert_eq!(bus.transport(&mut w).unwrap(), Duration::from_nanos(2));
        assert!(bus.decodes(0x1050));
        assert!(!bus.decodes(0x500));

        let mut r = read(0x20, 1);
        lock(&low).unwrap().transport(&mut r).unwrap();
        assert_eq!(r.data(), &[9]);
    }

    #[test]
    fn test_bus_unmapped_address_is_out_of_range() {
        let mut bus = SimpleBus::new("bus");
        let mut r = read(0x500, 4);
        let err = bus.transport(&mut r).unwrap_err();
        assert_eq!(err.reason(), "address-out-of-range");
    }

    #[test]
    fn test_bus_rejects_overlapping_windows() {
        let mem = shared(SimpleMemory::new("mem", AddressRange::new(0x0, 0x100)));
        let mut bus = SimpleBus::new("bus");
        bus.map(AddressRange::new(0x0, 0x100), mem.clone()).unwrap();
        let err = bus.map(AddressRange::new(0x80, 0x100), mem).unwrap_err();
        assert_eq!(err.reason(), "configuration");
    }
}
