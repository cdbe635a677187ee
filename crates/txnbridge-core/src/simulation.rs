//! Event loop driving the bridge on one simulated timeline
//!
//! The [`Kernel`] holds the shared mutable world (transaction pool and event
//! queue). [`Simulation`] pops events in time order and hands each to the
//! adapter; after every event it gives the initiator a chance to resubmit
//! refused requests and to ask for blocked responses again. The first fatal
//! error stops the run and is returned to the caller.

use core::time::Duration;

use tracing::{debug, trace};

use crate::adapter::{Admission, BoundaryAdapter, Upstream};
use crate::errors::Result;
use crate::packet::Packet;
use crate::router::NodeTask;
use crate::scheduler::EventQueue;
use crate::stats::RunStats;
use crate::transaction::{Phase, TransactionPool, TxnRef};

/// Something scheduled on the timeline
#[derive(Debug)]
pub enum SimEvent {
    /// Deferred work of node `node`
    Node { node: usize, task: NodeTask },
    /// Backward phase notification for the adapter
    Backward { txn: TxnRef, phase: Phase },
    /// A packet reaching the bridge from the initiator side
    Arrival(Box<Packet>),
}

/// Transaction pool and event queue
#[derive(Default)]
pub struct Kernel {
    pub pool: TransactionPool,
    pub queue: EventQueue<SimEvent>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.queue.now()
    }
}

pub struct Simulation<U: Upstream> {
    kernel: Kernel,
    adapter: BoundaryAdapter<U>,
    events: u64,
}

impl<U: Upstream> Simulation<U> {
    pub fn new(adapter: BoundaryAdapter<U>) -> Self {
        Self {
            kernel: Kernel::new(),
            adapter,
            events: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.kernel.now()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn adapter(&self) -> &BoundaryAdapter<U> {
        &self.adapter
    }

    pub fn upstream(&self) -> &U {
        self.adapter.upstream()
    }

    pub fn upstream_mut(&mut self) -> &mut U {
        self.adapter.upstream_mut()
    }

    /// Hand a packet to the bridge at the current time
    pub fn submit(&mut self, packet: Packet) -> Result<Admission> {
        self.adapter.recv(&mut self.kernel, packet)
    }

    /// Have a packet arrive `delay` from now
    pub fn schedule_arrival(&mut self, packet: Packet, delay: Duration) {
        self.kernel
            .queue
            .notify(SimEvent::Arrival(Box::new(packet)), delay);
    }

    /// Offer blocked responses to the initiator again
    pub fn recv_resp_retry(&mut self) -> Result<()> {
        self.adapter.recv_resp_retry(&mut self.kernel)
    }

    /// Process one event; `false` once nothing is left to do
    pub fn step(&mut self) -> Result<bool> {
        let Some((at, event)) = self.kernel.queue.pop() else {
            return self.service_upstream();
        };
        self.events += 1;
        trace!("t={:?} {:?}", at, event);

        match event {
            SimEvent::Node { node, task } => {
                self.adapter.on_node_task(&mut self.kernel, node, task)?
            }
            SimEvent::Backward { txn, phase } => {
                self.adapter.on_backward(&mut self.kernel, txn, phase)?
            }
            SimEvent::Arrival(packet) => self.arrive(*packet)?,
        }
        self.service_upstream()?;
        Ok(true)
    }

    /// Run until no event and no initiator request is left
    pub fn run_until_idle(&mut self) -> Result<()> {
        while self.step()? {}
        debug!(
            "idle at {:?} after {} events, {} transactions live",
            self.now(),
            self.events,
            self.kernel.pool.live()
        );
        Ok(())
    }

    /// Run every event that fires at or before `limit`, then move the clock there
    pub fn run_until(&mut self, limit: Duration) -> Result<()> {
        loop {
            if let Some(at) = self.kernel.queue.peek_time() {
                if at > limit {
                    break;
                }
            } else if !self.service_upstream()? {
                break;
            }
            if !self.kernel.queue.is_empty() {
                self.step()?;
            }
        }
        self.kernel.queue.advance_to(limit);
        Ok(())
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            end_time_ns: self.now().as_nanos(),
            events: self.events,
            pool: self.kernel.pool.stats().clone(),
            adapter: self.adapter.stats().clone(),
            nodes: self.adapter.node_stats(),
        }
    }

    fn arrive(&mut self, packet: Packet) -> Result<()> {
        if let Admission::Completed(response) = self.adapter.recv(&mut self.kernel, packet)? {
            self.adapter.upstream_mut().completed_inline(response);
        }
        Ok(())
    }

    /// Resubmissions and response retries requested by the initiator
    fn service_upstream(&mut self) -> Result<bool> {
        let mut worked = false;
        if self.adapter.upstream_mut().wants_response_retry() {
            self.adapter.recv_resp_retry(&mut self.kernel)?;
            worked = true;
        }
        for packet in self.adapter.upstream_mut().drain_resubmissions() {
            self.kernel
                .queue
                .notify(SimEvent::Arrival(Box::new(packet)), Duration::ZERO);
            worked = true;
        }
        Ok(worked)
    }
}
