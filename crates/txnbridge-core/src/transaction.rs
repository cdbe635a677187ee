//! Reference-counted transactions
//!
//! A [`Transaction`] is one request/response exchange. It lives in a
//! [`TransactionPool`] arena and is reached only through a [`TxnRef`], an
//! ownership token handed out by the pool. Every component that stores a
//! transaction beyond the current call holds its own token (obtained through
//! [`TransactionPool::acquire`]) and gives it back through
//! [`TransactionPool::release`], which consumes the token. A released token can
//! therefore never be dereferenced again; the slot generation guards against a
//! token being presented to the wrong pool.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, Result};
use crate::packet::SourceId;
use crate::stats::PoolStats;

// ----------------------------------------------------------------------------
// Handshake Phases
// ----------------------------------------------------------------------------

/// The four steps of the split handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Request offered to a node (request acceptance)
    BeginRequest,
    /// Node took the request (request-acknowledged)
    EndRequest,
    /// Response handed back to the initiator (response-ready / delivered)
    BeginResponse,
    /// Initiator consumed the response (response-acknowledged)
    EndResponse,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BeginRequest => "BEGIN_REQ",
            Phase::EndRequest => "END_REQ",
            Phase::BeginResponse => "BEGIN_RESP",
            Phase::EndResponse => "END_RESP",
        };
        f.write_str(name)
    }
}

/// Result of a non-blocking forward or backward call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Callee took the phase and will answer later through the scheduler
    Accepted,
    /// Callee moved the transaction on to the given phase, to be honoured after the delay
    Updated(Phase),
    /// Transaction finished inside the call
    Completed,
}

// ----------------------------------------------------------------------------
// Command and Status
// ----------------------------------------------------------------------------

/// Direction of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Read,
    Write,
    /// Carries no data phase (invalidations)
    Ignore,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Read => f.write_str("read"),
            Command::Write => f.write_str("write"),
            Command::Ignore => f.write_str("ignore"),
        }
    }
}

/// Completion status written by the executing target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResponseStatus {
    #[default]
    Incomplete,
    Ok,
    AddressError,
    CommandError,
}

impl ResponseStatus {
    pub fn is_ok(self) -> bool {
        self == ResponseStatus::Ok
    }
}

// ----------------------------------------------------------------------------
// Transaction Identity
// ----------------------------------------------------------------------------

/// Identity of a pooled transaction: slot index plus slot generation
///
/// A `TxnId` can be compared and logged but grants no access; only a
/// [`TxnRef`] reaches the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId {
    index: u32,
    generation: u32,
}

impl TxnId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}.{}", self.index, self.generation)
    }
}

/// Ownership token for one holder of a pooled transaction
///
/// Not `Clone`: a second holder must go through [`TransactionPool::acquire`],
/// and giving a token back through [`TransactionPool::release`] consumes it.
#[must_use = "a transaction token must be released back to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct TxnRef {
    id: TxnId,
}

impl TxnRef {
    pub fn id(&self) -> TxnId {
        self.id
    }
}

// ----------------------------------------------------------------------------
// Transaction
// ----------------------------------------------------------------------------

/// One request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    address: u64,
    command: Command,
    data: Vec<u8>,
    status: ResponseStatus,
    source: SourceId,
    phase: Phase,
    packet_id: u64,
}

impl Transaction {
    /// Create a fresh transaction in the request phase
    pub fn new(command: Command, address: u64, data: Vec<u8>, source: SourceId) -> Self {
        Self {
            address,
            command,
            data,
            status: ResponseStatus::Incomplete,
            source,
            phase: Phase::BeginRequest,
            packet_id: 0,
        }
    }

    /// Tag the transaction with the id of the packet it was built from
    pub fn with_packet_id(mut self, packet_id: u64) -> Self {
        self.packet_id = packet_id;
        self
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    pub fn is_read(&self) -> bool {
        self.command == Command::Read
    }

    pub fn is_write(&self) -> bool {
        self.command == Command::Write
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Data buffer, mutable in place; its length is fixed by the request
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the data buffer, changing the transfer length
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn data_length(&self) -> usize {
        self.data.len()
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ResponseStatus) {
        self.status = status;
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn packet_id(&self) -> u64 {
        self.packet_id
    }
}

// ----------------------------------------------------------------------------
// Transaction Pool
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    generation: u32,
    holders: u32,
    txn: Option<Transaction>,
}

/// Arena of transactions with generation-checked handles
#[derive(Debug, Default)]
pub struct TransactionPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    stats: PoolStats,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a transaction in the pool; the returned token is its first holder
    pub fn allocate(&mut self, txn: Transaction) -> TxnRef {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.holders = 1;
                slot.txn = Some(txn);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    holders: 1,
                    txn: Some(txn),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.stats.allocated += 1;
        self.stats.live += 1;
        self.stats.peak_live = self.stats.peak_live.max(self.stats.live);

        TxnRef {
            id: TxnId::new(index, self.slots[index as usize].generation),
        }
    }

    /// Register another holder and hand it its own token
    pub fn acquire(&mut self, txn: &TxnRef) -> Result<TxnRef> {
        let slot = self.live_slot_mut(txn.id)?;
        slot.holders += 1;
        Ok(TxnRef { id: txn.id })
    }

    /// Give a token back; returns `true` when this was the last holder and
    /// the transaction went back to the pool
    pub fn release(&mut self, txn: TxnRef) -> Result<bool> {
        let id = txn.id;
        let slot = self.live_slot_mut(id)?;
        slot.holders -= 1;
        if slot.holders > 0 {
            return Ok(false);
        }

        slot.txn = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.stats.freed += 1;
        self.stats.live -= 1;
        Ok(true)
    }

    pub fn get(&self, txn: &TxnRef) -> Result<&Transaction> {
        self.slots
            .get(txn.id.index as usize)
            .filter(|slot| slot.generation == txn.id.generation)
            .and_then(|slot| slot.txn.as_ref())
            .ok_or_else(|| BridgeError::stale(txn.id))
    }

    pub fn get_mut(&mut self, txn: &TxnRef) -> Result<&mut Transaction> {
        let id = txn.id;
        self.live_slot_mut(id)?
            .txn
            .as_mut()
            .ok_or_else(|| BridgeError::stale(id))
    }

    /// Number of tokens currently outstanding for a transaction
    pub fn holders(&self, txn: &TxnRef) -> Result<u32> {
        self.slots
            .get(txn.id.index as usize)
            .filter(|slot| slot.generation == txn.id.generation && slot.txn.is_some())
            .map(|slot| slot.holders)
            .ok_or_else(|| BridgeError::stale(txn.id))
    }

    /// Whether `id` still names a live transaction
    pub fn is_live(&self, id: TxnId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.txn.is_some())
    }

    /// Number of transactions not yet returned to the pool
    pub fn live(&self) -> usize {
        self.stats.live
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn live_slot_mut(&mut self, id: TxnId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.txn.is_some())
            .ok_or_else(|| BridgeError::stale(id))
    }
}
