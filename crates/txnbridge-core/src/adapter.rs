//! Boundary adapter between the initiator side and the routing nodes
//!
//! Turns inbound [`Packet`]s into pooled transactions tagged with their
//! source, drives them through a [`RouterNode`] under the control of the
//! [`BackpressureCoordinator`], and turns the final response back into a
//! [`PacketResponse`] for the [`Upstream`].

use alloc::collections::BTreeMap;
use core::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::backpressure::{BackpressureCoordinator, PacketKind};
use crate::errors::{BridgeError, ProtocolError, Result, RoutingError};
use crate::packet::{AccessMode, Packet, PacketCommand, PacketResponse, SourceId, SourceMap};
use crate::router::{NodeEffect, NodeEffects, NodeTask, RouterNode};
use crate::simulation::{Kernel, SimEvent};
use crate::stats::{AdapterStats, NodeStats};
use crate::transaction::{Phase, ResponseStatus, SyncStatus, Transaction, TxnId, TxnRef};

// ----------------------------------------------------------------------------
// Upstream Interface
// ----------------------------------------------------------------------------

/// The initiator side as seen from the bridge
pub trait Upstream {
    /// Offer a timed response; `false` means the initiator cannot take it now
    /// and will signal a response retry later
    fn send_timing_resp(&mut self, response: PacketResponse) -> bool;

    /// Tell `source` it may resubmit its refused request
    fn send_retry_req(&mut self, source: SourceId);

    /// A timed request was refused; the initiator keeps it until its retry
    fn request_refused(&mut self, _source: SourceId, _packet: Packet) {}

    /// Response for a request that completed inside the submitting call
    fn completed_inline(&mut self, _response: PacketResponse) {}

    /// Requests the initiator wants to send again now
    fn drain_resubmissions(&mut self) -> Vec<Packet> {
        Vec::new()
    }

    /// Whether the initiator is ready for blocked responses to be offered again
    fn wants_response_retry(&mut self) -> bool {
        false
    }
}

/// Answer to an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Taken into the timed handshake; the response follows later
    Accepted,
    /// Finished inside the call
    Completed(PacketResponse),
    /// Refused while the source is blocked; a retry will follow
    RetryLater,
}

/// How sources reach routing nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BindingMode {
    /// Every source goes through node 0
    Shared,
    /// Source `i` goes through node `i`
    #[default]
    PerSource,
}

#[derive(Debug)]
struct Outstanding {
    txn: TxnRef,
    node: usize,
    command: PacketCommand,
}

/// Queue node effects on the simulation timeline
pub(crate) fn schedule_effects(kernel: &mut Kernel, node: usize, effects: NodeEffects) {
    for effect in effects {
        match effect {
            NodeEffect::Schedule { task, delay } => {
                kernel.queue.notify(SimEvent::Node { node, task }, delay)
            }
            NodeEffect::Backward { txn, phase, delay } => {
                kernel.queue.notify(SimEvent::Backward { txn, phase }, delay)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Boundary Adapter
// ----------------------------------------------------------------------------

pub struct BoundaryAdapter<U: Upstream> {
    name: String,
    nodes: Vec<RouterNode>,
    binding: BindingMode,
    coordinator: BackpressureCoordinator,
    sources: SourceMap,
    outstanding: BTreeMap<TxnId, Outstanding>,
    upstream: U,
    stats: AdapterStats,
}

impl<U: Upstream> BoundaryAdapter<U> {
    pub fn new<N: Into<String>>(
        name: N,
        nodes: Vec<RouterNode>,
        binding: BindingMode,
        sources: SourceMap,
        upstream: U,
    ) -> Self {
        let coordinator = BackpressureCoordinator::new(sources.source_count());
        Self {
            name: name.into(),
            nodes,
            binding,
            coordinator,
            sources,
            outstanding: BTreeMap::new(),
            upstream,
            stats: AdapterStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &BackpressureCoordinator {
        &self.coordinator
    }

    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    pub fn nodes(&self) -> &[RouterNode] {
        &self.nodes
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn upstream_mut(&mut self) -> &mut U {
        &mut self.upstream
    }

    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    pub fn node_stats(&self) -> Vec<(String, NodeStats)> {
        self.nodes
            .iter()
            .map(|node| (node.name().to_string(), node.stats().clone()))
            .collect()
    }

    /// Timed transactions accepted and not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Node bound to `source`
    pub fn node_for(&self, source: SourceId) -> Result<usize> {
        let index = match self.binding {
            BindingMode::Shared => 0,
            BindingMode::PerSource => source.index(),
        };
        if index < self.nodes.len() {
            Ok(index)
        } else {
            Err(RoutingError::MissingDestinationBinding { source_id: source }.into())
        }
    }

    // ----- Inbound Requests -----

    /// Entry point for every inbound packet
    pub fn recv(&mut self, kernel: &mut Kernel, packet: Packet) -> Result<Admission> {
        match packet.mode {
            AccessMode::Atomic => self.recv_atomic(packet).map(Admission::Completed),
            AccessMode::Debug => self.recv_functional(packet).map(Admission::Completed),
            AccessMode::Timed => self.recv_timing_req(kernel, packet),
        }
    }

    /// Synchronous request, execute and response with no blocking state
    pub fn recv_atomic(&mut self, packet: Packet) -> Result<PacketResponse> {
        self.stats.atomic_requests += 1;
        let source = self.sources.lookup(packet.origin);
        if packet.command == PacketCommand::Invalidate {
            return Ok(self.invalidation(&packet, source));
        }

        let node = self.node_for(source)?;
        let mut txn = transaction_from(&packet, source);
        let latency = self.nodes[node].b_transport(&mut txn)?;
        trace!("{}: atomic {} done in {:?}", self.name, packet.id, latency);
        Ok(response_from(&txn, packet.command, latency))
    }

    /// Inspection access; never touches flow-control state
    pub fn recv_functional(&mut self, packet: Packet) -> Result<PacketResponse> {
        self.stats.debug_requests += 1;
        let source = self.sources.lookup(packet.origin);
        if packet.command == PacketCommand::Invalidate {
            return Ok(self.invalidation(&packet, source));
        }

        let node = self.node_for(source)?;
        let mut txn = transaction_from(&packet, source);
        let moved = self.nodes[node].transport_dbg(&mut txn)?;
        if moved != txn.data_length() {
            return Err(RoutingError::DebugTransportIncomplete {
                address: txn.address(),
                expected: txn.data_length(),
                actual: moved,
            }
            .into());
        }
        txn.set_status(ResponseStatus::Ok);
        Ok(response_from(&txn, packet.command, Duration::ZERO))
    }

    /// Timed request through the four-phase handshake
    pub fn recv_timing_req(&mut self, kernel: &mut Kernel, packet: Packet) -> Result<Admission> {
        self.stats.timed_requests += 1;
        let source = self.sources.lookup(packet.origin);
        if packet.command == PacketCommand::Invalidate {
            return Ok(Admission::Completed(self.invalidation(&packet, source)));
        }

        if self.coordinator.is_blocked(source, PacketKind::Request) {
            debug!(
                "{}: refused packet {} from {}, retry latched",
                self.name, packet.id, source
            );
            return Ok(self.refuse(source, packet));
        }

        let node = self.node_for(source)?;
        if !self.nodes[node].can_admit() {
            debug!(
                "{}: {} already has a request waiting, packet {} from {} latched",
                self.name,
                self.nodes[node].name(),
                packet.id,
                source
            );
            return Ok(self.refuse(source, packet));
        }

        let command = packet.command;
        let delay = packet.payload_delay;
        let txn = kernel.pool.allocate(transaction_from(&packet, source));
        let out = match self.nodes[node].nb_transport_fw(
            &mut kernel.pool,
            &txn,
            Phase::BeginRequest,
            delay,
        ) {
            Ok(out) => out,
            Err(err) => {
                kernel.pool.release(txn)?;
                return Err(err);
            }
        };
        schedule_effects(kernel, node, out.effects);
        self.admit(kernel, source, Outstanding { txn, node, command }, out.status)
    }

    fn refuse(&mut self, source: SourceId, packet: Packet) -> Admission {
        self.coordinator.mark_retry_needed(source, true);
        self.stats.refused += 1;
        self.upstream.request_refused(source, packet);
        Admission::RetryLater
    }

    /// Act on a node's answer to BEGIN_REQ
    ///
    /// An `Updated` answer is replayed as a backward phase at the current
    /// time; a `Completed` one is answered inline.
    fn admit(
        &mut self,
        kernel: &mut Kernel,
        source: SourceId,
        entry: Outstanding,
        status: SyncStatus,
    ) -> Result<Admission> {
        let id = entry.txn.id();
        match status {
            SyncStatus::Accepted => {
                trace!("{}: {} from {} accepted", self.name, id, source);
                self.coordinator
                    .record_blocking(source, Some(id), PacketKind::Request);
                self.outstanding.insert(id, entry);
                Ok(Admission::Accepted)
            }
            SyncStatus::Updated(phase) => {
                let back = kernel.pool.acquire(&entry.txn)?;
                kernel
                    .queue
                    .notify(SimEvent::Backward { txn: back, phase }, Duration::ZERO);
                self.coordinator
                    .record_blocking(source, Some(id), PacketKind::Request);
                self.outstanding.insert(id, entry);
                Ok(Admission::Accepted)
            }
            SyncStatus::Completed => {
                let response =
                    response_from(kernel.pool.get(&entry.txn)?, entry.command, Duration::ZERO);
                kernel.pool.release(entry.txn)?;
                Ok(Admission::Completed(response))
            }
        }
    }

    fn invalidation(&mut self, packet: &Packet, source: SourceId) -> PacketResponse {
        self.stats.invalidations += 1;
        trace!("{}: invalidation {} answered inline", self.name, packet.id);
        PacketResponse {
            id: packet.id,
            source,
            address: packet.address,
            command: packet.command,
            status: ResponseStatus::Ok,
            data: Vec::new(),
            latency: Duration::ZERO,
        }
    }

    // ----- Scheduled Work -----

    /// Run a task a node deferred to itself
    pub fn on_node_task(&mut self, kernel: &mut Kernel, node: usize, task: NodeTask) -> Result<()> {
        let effects = self.nodes[node].on_task(&mut kernel.pool, task)?;
        schedule_effects(kernel, node, effects);
        Ok(())
    }

    /// Backward phase from a node, after its annotated delay
    pub fn on_backward(&mut self, kernel: &mut Kernel, txn: TxnRef, phase: Phase) -> Result<()> {
        let result = self.handle_backward(kernel, txn.id(), phase);
        kernel.pool.release(txn)?;
        result
    }

    fn handle_backward(&mut self, kernel: &mut Kernel, id: TxnId, phase: Phase) -> Result<()> {
        if !matches!(phase, Phase::EndRequest | Phase::BeginResponse) {
            return Err(BridgeError::illegal_phase(self.name.clone(), id, phase));
        }

        // an early response also acknowledges the request
        if let Some(source) = self.coordinator.owner_of(id, PacketKind::Request) {
            self.coordinator.record_blocking(source, None, PacketKind::Request);
            self.release_latched_retries();
        }
        if phase == Phase::EndRequest {
            return Ok(());
        }

        let (source, response) = self.build_response(kernel, id)?;
        if let Some(pending) = self.coordinator.blocking(source, PacketKind::Response) {
            return Err(ProtocolError::DoublePendingResponse {
                node: self.name.clone(),
                txn: id,
                pending,
            }
            .into());
        }

        if self.upstream.send_timing_resp(response) {
            self.finish(kernel, id)
        } else {
            warn!("{}: {} could not take response for {}", self.name, source, id);
            self.stats.blocked_responses += 1;
            self.coordinator
                .record_blocking(source, Some(id), PacketKind::Response);
            Ok(())
        }
    }

    /// The initiator can take responses again: drain every blocked one
    pub fn recv_resp_retry(&mut self, kernel: &mut Kernel) -> Result<()> {
        while let Some((source, id)) = self.coordinator.any_blocked_response() {
            let (_, response) = self.build_response(kernel, id)?;
            if !self.upstream.send_timing_resp(response) {
                debug!("{}: response for {} refused again", self.name, id);
                break;
            }
            self.coordinator
                .record_blocking(source, None, PacketKind::Response);
            self.finish(kernel, id)?;
        }
        self.release_latched_retries();
        Ok(())
    }

    fn build_response(&self, kernel: &Kernel, id: TxnId) -> Result<(SourceId, PacketResponse)> {
        let entry = self
            .outstanding
            .get(&id)
            .ok_or_else(|| BridgeError::stale(id))?;
        let txn = kernel.pool.get(&entry.txn)?;
        Ok((
            txn.source(),
            response_from(txn, entry.command, Duration::ZERO),
        ))
    }

    /// Acknowledge the response at the node and drop the adapter's hold
    fn finish(&mut self, kernel: &mut Kernel, id: TxnId) -> Result<()> {
        let entry = self
            .outstanding
            .remove(&id)
            .ok_or_else(|| BridgeError::stale(id))?;
        self.stats.responses_delivered += 1;

        let out = self.nodes[entry.node].nb_transport_fw(
            &mut kernel.pool,
            &entry.txn,
            Phase::EndResponse,
            Duration::ZERO,
        );
        kernel.pool.release(entry.txn)?;
        schedule_effects(kernel, entry.node, out?.effects);
        Ok(())
    }

    /// A source without a bound node is let through so its resubmission
    /// reports the missing binding
    fn node_has_room(&self, source: SourceId) -> bool {
        self.node_for(source)
            .map_or(true, |node| self.nodes[node].can_admit())
    }

    /// Send one retry to every latched source that is no longer blocked and
    /// whose node has room
    fn release_latched_retries(&mut self) {
        let ready: Vec<SourceId> = self
            .coordinator
            .sources()
            .filter(|source| {
                self.coordinator.retry_needed(*source)
                    && !self.coordinator.is_blocked(*source, PacketKind::Request)
                    && self.node_has_room(*source)
            })
            .collect();

        for source in ready {
            debug!("{}: retry to {}", self.name, source);
            self.coordinator.mark_retry_needed(source, false);
            self.stats.retries_sent += 1;
            self.upstream.send_retry_req(source);
        }
    }
}

fn transaction_from(packet: &Packet, source: SourceId) -> Transaction {
    Transaction::new(
        packet.command.into(),
        packet.address,
        packet.data.clone(),
        source,
    )
    .with_packet_id(packet.id)
}

fn response_from(txn: &Transaction, command: PacketCommand, latency: Duration) -> PacketResponse {
    PacketResponse {
        id: txn.packet_id(),
        source: txn.source(),
        address: txn.address(),
        command,
        status: txn.status(),
        data: txn.data().to_vec(),
        latency,
    }
}
