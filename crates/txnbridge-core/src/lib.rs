//! Transaction bridge core
//!
//! Routes requests from many independent sources through split-phase router
//! nodes to a memory and a secondary fabric. Every request follows the
//! four-phase handshake (request, request acknowledged, response, response
//! acknowledged); each node runs at most one request at a time, and a
//! backpressure coordinator refuses sources whose previous request is still
//! pending and later tells them to retry.
//!
//! Everything runs on one simulated timeline driven by [`Simulation`].

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod adapter;
pub mod backpressure;
pub mod config;
pub mod errors;
pub mod initiator;
pub mod packet;
pub mod router;
pub mod scheduler;
pub mod simulation;
pub mod stats;
pub mod target;
pub mod transaction;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use adapter::{Admission, BindingMode, BoundaryAdapter, Upstream};
pub use backpressure::{BackpressureCoordinator, PacketKind};
pub use config::{StrategyKind, SystemConfig};
pub use errors::{
    BridgeError, BridgeResult, ConfigError, ProtocolError, Result, RoutingError, TargetError,
};
pub use initiator::RecordingInitiator;
pub use packet::{
    AccessMode, Packet, PacketCommand, PacketResponse, RequestorId, SourceGroup, SourceId,
    SourceMap,
};
pub use router::{BusRelay, ExecuteStrategy, LocalExecute, NodeState, NodeTiming, RouterNode};
pub use scheduler::EventQueue;
pub use simulation::{Kernel, SimEvent, Simulation};
pub use stats::{AdapterStats, NodeStats, PoolStats, RunStats};
pub use target::{shared, AddressRange, SharedTarget, SimpleBus, SimpleMemory, Target};
pub use transaction::{
    Command, Phase, ResponseStatus, SyncStatus, Transaction, TransactionPool, TxnId, TxnRef,
};
