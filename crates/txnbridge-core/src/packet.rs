//! External packet representation and source identity
//!
//! Packets are what the initiator side speaks. The [`SourceMap`] turns a
//! packet's requestor id into the [`SourceId`] the backpressure coordinator
//! keys on; anything it does not know about is attributed to the system
//! source.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{ConfigError, Result};
use crate::transaction::{Command, ResponseStatus};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

/// Stable identifier of a request source; 0 is the privileged system source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(u16);

impl SourceId {
    /// The system port (writebacks, functional accesses, interrupts)
    pub const SYSTEM: Self = Self(0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_system(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            f.write_str("system")
        } else {
            write!(f, "source{}", self.0)
        }
    }
}

/// Identifier the initiator side stamps on every packet it sends
pub type RequestorId = u32;

// ----------------------------------------------------------------------------
// Packets
// ----------------------------------------------------------------------------

/// What the packet asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketCommand {
    Read,
    Write,
    Invalidate,
}

impl From<PacketCommand> for Command {
    fn from(command: PacketCommand) -> Self {
        match command {
            PacketCommand::Read => Command::Read,
            PacketCommand::Write => Command::Write,
            PacketCommand::Invalidate => Command::Ignore,
        }
    }
}

/// How the packet travels through the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Synchronous request, execute and response in one call
    Atomic,
    /// Direct inspection access with no flow control
    Debug,
    /// Full four-phase handshake with backpressure and retries
    #[default]
    Timed,
}

/// Inbound request from an initiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u64,
    pub address: u64,
    pub command: PacketCommand,
    /// Payload for writes; for reads its length is the number of bytes wanted
    pub data: Vec<u8>,
    pub origin: RequestorId,
    pub mode: AccessMode,
    /// Annotated delay before the request is seen downstream
    pub payload_delay: Duration,
}

impl Packet {
    pub fn read(id: u64, origin: RequestorId, address: u64, length: usize) -> Self {
        Self {
            id,
            address,
            command: PacketCommand::Read,
            data: vec![0; length],
            origin,
            mode: AccessMode::Timed,
            payload_delay: Duration::ZERO,
        }
    }

    pub fn write(id: u64, origin: RequestorId, address: u64, data: Vec<u8>) -> Self {
        Self {
            id,
            address,
            command: PacketCommand::Write,
            data,
            origin,
            mode: AccessMode::Timed,
            payload_delay: Duration::ZERO,
        }
    }

    pub fn invalidate(id: u64, origin: RequestorId, address: u64) -> Self {
        Self {
            id,
            address,
            command: PacketCommand::Invalidate,
            data: Vec::new(),
            origin,
            mode: AccessMode::Timed,
            payload_delay: Duration::ZERO,
        }
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_payload_delay(mut self, delay: Duration) -> Self {
        self.payload_delay = delay;
        self
    }
}

/// Response notification sent back to the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketResponse {
    pub id: u64,
    pub source: SourceId,
    pub address: u64,
    pub command: PacketCommand,
    pub status: ResponseStatus,
    /// Read data, or the written bytes echoed back
    pub data: Vec<u8>,
    /// Latency accumulated on the atomic path
    pub latency: Duration,
}

// ----------------------------------------------------------------------------
// Source Map
// ----------------------------------------------------------------------------

/// Named group of requestor ids that share one source id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub name: String,
    pub requestors: Vec<RequestorId>,
}

/// Reverse lookup from requestor id to source id
///
/// Group `i` in configuration order gets source id `i + 1`; id 0 stays
/// reserved for the system source.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    groups: Vec<SourceGroup>,
}

impl SourceMap {
    pub fn new(groups: Vec<SourceGroup>) -> Result<Self> {
        for (i, group) in groups.iter().enumerate() {
            for later in &groups[i + 1..] {
                if let Some(requestor) = group
                    .requestors
                    .iter()
                    .find(|r| later.requestors.contains(r))
                {
                    return Err(ConfigError::DuplicateRequestor {
                        requestor: *requestor,
                        first: group.name.clone(),
                        second: later.name.clone(),
                    }
                    .into());
                }
            }
        }

        if groups.len() >= u16::MAX as usize {
            return Err(ConfigError::Invalid {
                reason: format!("{} source groups exceed the source id space", groups.len()),
            }
            .into());
        }

        Ok(Self { groups })
    }

    /// Log the table, one line per source group
    pub fn log_table(&self) {
        for (i, group) in self.groups.iter().enumerate() {
            info!(
                "source {} ({}) <- requestors {:?}",
                i + 1,
                group.name,
                group.requestors
            );
        }
    }

    /// Source id for a requestor, falling back to the system source
    pub fn lookup(&self, requestor: RequestorId) -> SourceId {
        self.groups
            .iter()
            .position(|group| group.requestors.contains(&requestor))
            .map(|i| SourceId::new((i + 1) as u16))
            .unwrap_or(SourceId::SYSTEM)
    }

    /// Number of sources including the system source
    pub fn source_count(&self) -> usize {
        self.groups.len() + 1
    }

    pub fn name(&self, source: SourceId) -> &str {
        if source.is_system() {
            return "system";
        }
        self.groups
            .get(source.index() - 1)
            .map(|group| group.name.as_str())
            .unwrap_or("unknown")
    }
}
