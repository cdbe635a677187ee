//! Split-phase router node
//!
//! One node guards one downstream resource and enforces its concurrency
//! bound: at most one request executing, one request parked behind it and one
//! completed transaction waiting for the response slot. The node never calls
//! the scheduler or the initiator directly. Every call returns the effects it
//! wants carried out (deferred tasks for itself, backward phase notifications
//! for the initiator) and the caller applies them.
//!
//! The router and wrapper variants are the same node with a different
//! [`ExecuteStrategy`]: the router executes in-range requests on its direct
//! memory link, the wrapper relays them through the secondary fabric.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::errors::{BridgeError, ProtocolError, Result};
use crate::stats::NodeStats;
use crate::target::{lock, AddressRange, SharedTarget};
use crate::transaction::{
    Phase, ResponseStatus, SyncStatus, Transaction, TransactionPool, TxnId, TxnRef,
};

// ----------------------------------------------------------------------------
// Execute Strategies
// ----------------------------------------------------------------------------

/// Final executor for requests inside the node's memory range
pub trait ExecuteStrategy: Send {
    /// Short label used in logs and configuration
    fn label(&self) -> &'static str;

    /// Execute the transaction and return the latency added downstream
    fn execute(&mut self, txn: &mut Transaction, fabric: &SharedTarget) -> Result<Duration>;

    /// Inspection access; returns the number of bytes moved
    fn inspect(&mut self, txn: &mut Transaction, fabric: &SharedTarget) -> Result<usize>;
}

/// Executes against a direct memory link
pub struct LocalExecute {
    memory: SharedTarget,
}

impl LocalExecute {
    pub fn new(memory: SharedTarget) -> Self {
        Self { memory }
    }
}

impl ExecuteStrategy for LocalExecute {
    fn label(&self) -> &'static str {
        "local"
    }

    fn execute(&mut self, txn: &mut Transaction, _fabric: &SharedTarget) -> Result<Duration> {
        lock(&self.memory)?.transport(txn)
    }

    fn inspect(&mut self, txn: &mut Transaction, _fabric: &SharedTarget) -> Result<usize> {
        lock(&self.memory)?.transport_dbg(txn)
    }
}

/// Relays everything through the secondary fabric
#[derive(Debug, Default)]
pub struct BusRelay;

impl ExecuteStrategy for BusRelay {
    fn label(&self) -> &'static str {
        "bus-relay"
    }

    fn execute(&mut self, txn: &mut Transaction, fabric: &SharedTarget) -> Result<Duration> {
        lock(fabric)?.transport(txn)
    }

    fn inspect(&mut self, txn: &mut Transaction, fabric: &SharedTarget) -> Result<usize> {
        lock(fabric)?.transport_dbg(txn)
    }
}

// ----------------------------------------------------------------------------
// Timing, Tasks and Effects
// ----------------------------------------------------------------------------

/// Delays the node annotates on its own phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTiming {
    /// From taking a request to acknowledging it
    pub accept_delay: Duration,
    /// From acknowledging a request to executing it
    pub execute_latency: Duration,
    /// From executing to offering the response
    pub response_delay: Duration,
}

impl Default for NodeTiming {
    fn default() -> Self {
        Self {
            accept_delay: Duration::from_nanos(10),
            execute_latency: Duration::from_nanos(15),
            response_delay: Duration::from_nanos(10),
        }
    }
}

/// Work the node deferred to itself
#[derive(Debug)]
pub enum NodeTask {
    /// A forward phase arriving after its annotated delay
    Phase { txn: TxnRef, phase: Phase },
    /// Run the transaction in flight downstream
    Execute,
}

/// Side effects requested by a node call
#[derive(Debug)]
pub enum NodeEffect {
    /// Run `task` on this node after `delay`
    Schedule { task: NodeTask, delay: Duration },
    /// Tell the initiator that `txn` reached `phase`, after `delay`
    Backward {
        txn: TxnRef,
        phase: Phase,
        delay: Duration,
    },
}

pub type NodeEffects = SmallVec<[NodeEffect; 4]>;

/// Answer to a forward call
#[derive(Debug)]
pub struct NodeOutput {
    pub status: SyncStatus,
    pub effects: NodeEffects,
}

/// Where an address executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Inside the node's memory range, through the execute strategy
    Memory,
    /// Claimed by the secondary fabric, forwarded verbatim
    Fabric,
}

/// Coarse view of the node's main slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    /// A request was offered and its arrival is still scheduled
    RequestPending,
    Executing,
    /// A response is with the initiator awaiting acknowledgement
    ResponsePending,
}

// ----------------------------------------------------------------------------
// Router Node
// ----------------------------------------------------------------------------

pub struct RouterNode {
    name: String,
    memory_range: AddressRange,
    fabric: SharedTarget,
    strategy: Box<dyn ExecuteStrategy>,
    timing: NodeTiming,
    arrivals: usize,
    in_flight: Option<TxnRef>,
    delivering: Option<TxnRef>,
    queued_request: Option<TxnRef>,
    queued_response: Option<TxnRef>,
    stats: NodeStats,
}

impl RouterNode {
    pub fn new<N: Into<String>>(
        name: N,
        memory_range: AddressRange,
        fabric: SharedTarget,
        strategy: Box<dyn ExecuteStrategy>,
        timing: NodeTiming,
    ) -> Self {
        Self {
            name: name.into(),
            memory_range,
            fabric,
            strategy,
            timing,
            arrivals: 0,
            in_flight: None,
            delivering: None,
            queued_request: None,
            queued_response: None,
            stats: NodeStats::default(),
        }
    }

    /// Node that executes in-range requests on a direct memory link
    pub fn router<N: Into<String>>(
        name: N,
        memory_range: AddressRange,
        memory: SharedTarget,
        fabric: SharedTarget,
        timing: NodeTiming,
    ) -> Self {
        Self::new(
            name,
            memory_range,
            fabric,
            Box::new(LocalExecute::new(memory)),
            timing,
        )
    }

    /// Node that relays every request through the fabric
    pub fn wrapper<N: Into<String>>(
        name: N,
        memory_range: AddressRange,
        fabric: SharedTarget,
        timing: NodeTiming,
    ) -> Self {
        Self::new(name, memory_range, fabric, Box::new(BusRelay), timing)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &'static str {
        self.strategy.label()
    }

    pub fn memory_range(&self) -> AddressRange {
        self.memory_range
    }

    pub fn timing(&self) -> NodeTiming {
        self.timing
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn state(&self) -> NodeState {
        if self.in_flight.is_some() {
            NodeState::Executing
        } else if self.delivering.is_some() {
            NodeState::ResponsePending
        } else if self.arrivals > 0 {
            NodeState::RequestPending
        } else {
            NodeState::Idle
        }
    }

    pub fn in_flight(&self) -> Option<TxnId> {
        self.in_flight.as_ref().map(TxnRef::id)
    }

    pub fn delivering(&self) -> Option<TxnId> {
        self.delivering.as_ref().map(TxnRef::id)
    }

    pub fn queued_request(&self) -> Option<TxnId> {
        self.queued_request.as_ref().map(TxnRef::id)
    }

    pub fn queued_response(&self) -> Option<TxnId> {
        self.queued_response.as_ref().map(TxnRef::id)
    }

    /// Number of transactions the node currently holds
    pub fn occupancy(&self) -> usize {
        [
            &self.in_flight,
            &self.delivering,
            &self.queued_request,
            &self.queued_response,
        ]
        .iter()
        .filter(|slot| slot.is_some())
        .count()
    }

    /// Whether one more request can be offered without a second one ending
    /// up in the request slot
    ///
    /// Requests still travelling to the node count as waiting; an idle node
    /// takes one of them straight away.
    pub fn can_admit(&self) -> bool {
        match (self.arrivals, self.queued_request.is_some()) {
            (0, false) => true,
            (1, false) => !self.is_busy(),
            _ => false,
        }
    }

    /// Decide where an address executes
    pub fn decode(&self, address: u64, txn: Option<TxnId>) -> Result<Route> {
        if self.memory_range.contains(address) {
            return Ok(Route::Memory);
        }
        if lock(&self.fabric)?.decodes(address) {
            return Ok(Route::Fabric);
        }
        Err(BridgeError::out_of_range(self.name.clone(), address, txn))
    }

    // ----- Timed Path -----

    /// Forward phase from the initiator
    ///
    /// A request is decoded before anything is stored, so an address no
    /// range claims fails without touching node state.
    pub fn nb_transport_fw(
        &mut self,
        pool: &mut TransactionPool,
        txn: &TxnRef,
        phase: Phase,
        delay: Duration,
    ) -> Result<NodeOutput> {
        match phase {
            Phase::BeginRequest => {
                let address = pool.get(txn)?.address();
                self.decode(address, Some(txn.id()))?;
                self.arrivals += 1;
            }
            Phase::EndResponse => {}
            other => return Err(BridgeError::illegal_phase(self.name.clone(), txn.id(), other)),
        }

        trace!("{}: {} {} in {:?}", self.name, txn.id(), phase, delay);
        let held = pool.acquire(txn)?;
        let mut effects = NodeEffects::new();
        effects.push(NodeEffect::Schedule {
            task: NodeTask::Phase { txn: held, phase },
            delay,
        });
        Ok(NodeOutput {
            status: SyncStatus::Accepted,
            effects,
        })
    }

    /// Run a task this node scheduled earlier
    pub fn on_task(&mut self, pool: &mut TransactionPool, task: NodeTask) -> Result<NodeEffects> {
        let mut effects = NodeEffects::new();
        match task {
            NodeTask::Phase {
                txn,
                phase: Phase::BeginRequest,
            } => {
                self.arrivals = self.arrivals.saturating_sub(1);
                self.begin_request(pool, txn, &mut effects)?;
            }
            NodeTask::Phase {
                txn,
                phase: Phase::EndResponse,
            } => self.end_response(pool, txn, &mut effects)?,
            NodeTask::Phase { txn, phase } => {
                let id = txn.id();
                pool.release(txn)?;
                return Err(BridgeError::illegal_phase(self.name.clone(), id, phase));
            }
            NodeTask::Execute => self.execute_in_flight(pool, &mut effects)?,
        }
        self.stats.peak_occupancy = self.stats.peak_occupancy.max(self.occupancy());
        Ok(effects)
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.queued_response.is_some()
    }

    fn begin_request(
        &mut self,
        pool: &mut TransactionPool,
        txn: TxnRef,
        effects: &mut NodeEffects,
    ) -> Result<()> {
        if !self.is_busy() {
            return self.accept(pool, txn, effects);
        }

        if let Some(pending) = self.queued_request() {
            let id = txn.id();
            pool.release(txn)?;
            return Err(ProtocolError::DoublePendingRequest {
                node: self.name.clone(),
                txn: id,
                pending,
            }
            .into());
        }

        debug!(
            "{}: {} waits behind {:?}",
            self.name,
            txn.id(),
            self.in_flight()
        );
        self.stats.queued_requests += 1;
        self.queued_request = Some(txn);
        Ok(())
    }

    fn accept(
        &mut self,
        pool: &mut TransactionPool,
        txn: TxnRef,
        effects: &mut NodeEffects,
    ) -> Result<()> {
        pool.get_mut(&txn)?.set_phase(Phase::EndRequest);
        let back = pool.acquire(&txn)?;
        trace!("{}: accepted {}", self.name, txn.id());

        effects.push(NodeEffect::Backward {
            txn: back,
            phase: Phase::EndRequest,
            delay: self.timing.accept_delay,
        });
        effects.push(NodeEffect::Schedule {
            task: NodeTask::Execute,
            delay: self.timing.accept_delay + self.timing.execute_latency,
        });
        self.in_flight = Some(txn);
        self.stats.accepted += 1;
        Ok(())
    }

    fn execute_in_flight(
        &mut self,
        pool: &mut TransactionPool,
        effects: &mut NodeEffects,
    ) -> Result<()> {
        let txn = self
            .in_flight
            .take()
            .ok_or_else(|| ProtocolError::NothingInFlight {
                component: self.name.clone(),
            })?;

        let latency = match self.run(pool, &txn) {
            Ok(latency) => latency,
            Err(err) => {
                self.in_flight = Some(txn);
                return Err(err);
            }
        };
        self.stats.executed += 1;
        pool.get_mut(&txn)?.set_phase(Phase::BeginResponse);

        if self.delivering.is_none() {
            return self.deliver(pool, txn, latency, effects);
        }

        if let Some(pending) = self.queued_response() {
            let id = txn.id();
            pool.release(txn)?;
            return Err(ProtocolError::DoublePendingResponse {
                node: self.name.clone(),
                txn: id,
                pending,
            }
            .into());
        }

        debug!(
            "{}: response for {} waits behind {:?}",
            self.name,
            txn.id(),
            self.delivering()
        );
        self.stats.queued_responses += 1;
        self.queued_response = Some(txn);
        Ok(())
    }

    fn run(&mut self, pool: &mut TransactionPool, txn: &TxnRef) -> Result<Duration> {
        let address = pool.get(txn)?.address();
        let route = self.decode(address, Some(txn.id()))?;
        let t = pool.get_mut(txn)?;
        let latency = match route {
            Route::Memory => self.strategy.execute(t, &self.fabric)?,
            Route::Fabric => lock(&self.fabric)?.transport(t)?,
        };
        t.set_status(ResponseStatus::Ok);
        Ok(latency)
    }

    fn deliver(
        &mut self,
        pool: &mut TransactionPool,
        txn: TxnRef,
        extra: Duration,
        effects: &mut NodeEffects,
    ) -> Result<()> {
        let back = pool.acquire(&txn)?;
        trace!("{}: response ready for {}", self.name, txn.id());
        effects.push(NodeEffect::Backward {
            txn: back,
            phase: Phase::BeginResponse,
            delay: extra + self.timing.response_delay,
        });
        self.delivering = Some(txn);
        self.stats.delivered += 1;
        Ok(())
    }

    fn end_response(
        &mut self,
        pool: &mut TransactionPool,
        txn: TxnRef,
        effects: &mut NodeEffects,
    ) -> Result<()> {
        let current = match self.delivering.take() {
            Some(current) if current.id() == txn.id() => current,
            other => {
                self.delivering = other;
                let id = txn.id();
                pool.release(txn)?;
                return Err(BridgeError::illegal_phase(
                    self.name.clone(),
                    id,
                    Phase::EndResponse,
                ));
            }
        };

        pool.get_mut(&current)?.set_phase(Phase::EndResponse);
        trace!("{}: {} acknowledged", self.name, current.id());
        pool.release(current)?;
        pool.release(txn)?;
        self.stats.acknowledged += 1;

        if let Some(next) = self.queued_response.take() {
            self.deliver(pool, next, Duration::ZERO, effects)?;
        }
        if !self.is_busy() {
            if let Some(next) = self.queued_request.take() {
                self.accept(pool, next, effects)?;
            }
        }
        Ok(())
    }

    // ----- Atomic and Debug Paths -----

    /// Synchronous request, execute and response in one call
    pub fn b_transport(&mut self, txn: &mut Transaction) -> Result<Duration> {
        self.stats.atomic += 1;
        let latency = match self.decode(txn.address(), None)? {
            Route::Memory => self.strategy.execute(txn, &self.fabric)?,
            Route::Fabric => lock(&self.fabric)?.transport(txn)?,
        };
        txn.set_status(ResponseStatus::Ok);
        Ok(latency)
    }

    /// Inspection access with no flow control; returns the bytes moved
    pub fn transport_dbg(&mut self, txn: &mut Transaction) -> Result<usize> {
        let route = self.decode(txn.address(), None)?;
        self.stats.debug += 1;
        match route {
            Route::Memory => self.strategy.inspect(txn, &self.fabric),
            Route::Fabric => lock(&self.fabric)?.transport_dbg(txn),
        }
    }
}
