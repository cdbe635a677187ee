//! Run statistics
//!
//! Plain counters kept by each component and dumped at the end of a run.

use serde::Serialize;

/// Transaction pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub allocated: u64,
    pub freed: u64,
    pub live: usize,
    pub peak_live: usize,
}

/// Per routing node counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Requests taken into execution
    pub accepted: u64,
    /// Requests that had to wait in the request slot
    pub queued_requests: u64,
    /// Completed transactions that had to wait for the response slot
    pub queued_responses: u64,
    pub executed: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub atomic: u64,
    pub debug: u64,
    /// Highest number of transactions held by the node at once
    pub peak_occupancy: usize,
}

/// Boundary adapter counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub timed_requests: u64,
    pub atomic_requests: u64,
    pub debug_requests: u64,
    pub invalidations: u64,
    /// Timed requests refused with "retry later"
    pub refused: u64,
    pub retries_sent: u64,
    /// Responses the initiator could not take at first attempt
    pub blocked_responses: u64,
    pub responses_delivered: u64,
}

/// Everything a run reports
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Simulated time at the end of the run, in nanoseconds
    pub end_time_ns: u128,
    pub events: u64,
    pub pool: PoolStats,
    pub adapter: AdapterStats,
    pub nodes: Vec<(String, NodeStats)>,
}
