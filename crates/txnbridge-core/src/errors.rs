//! Error types for the transaction bridge
//!
//! Everything in here is fatal. Flow-control conditions (a blocked source, a
//! required retry) are not errors and never travel through this module; they
//! are ordinary return values such as [`crate::adapter::Admission::RetryLater`].

use crate::packet::SourceId;
use crate::transaction::{Phase, TxnId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Violations of the four-phase handshake or of a node's concurrency bound
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("illegal phase {phase} for {txn} at {component}")]
    IllegalPhase {
        component: String,
        txn: TxnId,
        phase: Phase,
    },
    #[error("attempt to have two pending requests at {node} ({txn} arrived, {pending} waiting)")]
    DoublePendingRequest {
        node: String,
        txn: TxnId,
        pending: TxnId,
    },
    #[error("attempt to have two pending responses at {node} ({txn} completed, {pending} waiting)")]
    DoublePendingResponse {
        node: String,
        txn: TxnId,
        pending: TxnId,
    },
    #[error("{component} has no transaction in flight to execute")]
    NothingInFlight { component: String },
    #[error("transaction handle {txn} does not refer to a live transaction")]
    StaleTransaction { txn: TxnId },
}

/// Address decode and destination binding failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("address {address:#x} is outside every range known to {component}")]
    AddressOutOfRange {
        component: String,
        address: u64,
        txn: Option<TxnId>,
    },
    #[error("no destination bound for source {source_id}")]
    MissingDestinationBinding { source_id: SourceId },
    #[error("debug transport moved {actual} of {expected} bytes at {address:#x}")]
    DebugTransportIncomplete {
        address: u64,
        expected: usize,
        actual: usize,
    },
    #[error("command {command} is not supported on the {mode} path")]
    UnsupportedCommand { command: String, mode: String },
}

/// Failures inside a downstream target (memory, bus)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("{target}: access of {length} bytes at {address:#x} leaves [{base:#x}, {end:#x})")]
    AccessOutOfBounds {
        target: String,
        address: u64,
        length: usize,
        base: u64,
        end: u64,
    },
    #[error("{target}: write to read-only memory at {address:#x}")]
    ReadOnly { target: String, address: u64 },
    #[error("{target}: access latch poisoned")]
    LatchPoisoned { target: String },
}

/// Invalid system description
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
    #[error("address windows {first} and {second} overlap")]
    OverlappingRanges { first: String, second: String },
    #[error("requestor {requestor} is listed under both {first} and {second}")]
    DuplicateRequestor {
        requestor: u32,
        first: String,
        second: String,
    },
}

// ----------------------------------------------------------------------------
// Bridge Error
// ----------------------------------------------------------------------------

/// Core error type for the transaction bridge
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Stable name of the failure, used in diagnostics and by the CLI exit report
    pub fn reason(&self) -> &'static str {
        match self {
            BridgeError::Protocol(err) => match err {
                ProtocolError::IllegalPhase { .. } | ProtocolError::NothingInFlight { .. } => {
                    "illegal-phase"
                }
                ProtocolError::DoublePendingRequest { .. } => "double-pending-request",
                ProtocolError::DoublePendingResponse { .. } => "double-pending-response",
                ProtocolError::StaleTransaction { .. } => "stale-transaction",
            },
            BridgeError::Routing(err) => match err {
                RoutingError::AddressOutOfRange { .. } => "address-out-of-range",
                RoutingError::MissingDestinationBinding { .. } => "missing-destination-binding",
                RoutingError::DebugTransportIncomplete { .. } => "debug-transport-incomplete",
                RoutingError::UnsupportedCommand { .. } => "unsupported-command",
            },
            BridgeError::Target(err) => match err {
                TargetError::AccessOutOfBounds { .. } | TargetError::ReadOnly { .. } => {
                    "memory-access"
                }
                TargetError::LatchPoisoned { .. } => "latch-poisoned",
            },
            BridgeError::Config(_) => "configuration",
        }
    }

    /// Create an address decode failure
    pub fn out_of_range<C: Into<String>>(component: C, address: u64, txn: Option<TxnId>) -> Self {
        BridgeError::Routing(RoutingError::AddressOutOfRange {
            component: component.into(),
            address,
            txn,
        })
    }

    /// Create an illegal phase error
    pub fn illegal_phase<C: Into<String>>(component: C, txn: TxnId, phase: Phase) -> Self {
        BridgeError::Protocol(ProtocolError::IllegalPhase {
            component: component.into(),
            txn,
            phase,
        })
    }

    /// Create an invalid configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BridgeError::Config(ConfigError::Invalid {
            reason: reason.into(),
        })
    }

    /// Create a stale handle error
    pub fn stale(txn: TxnId) -> Self {
        BridgeError::Protocol(ProtocolError::StaleTransaction { txn })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, BridgeError>;
pub type BridgeResult<T> = Result<T>;
