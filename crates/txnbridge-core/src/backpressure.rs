//! Multi-source backpressure coordinator
//!
//! Tracks, per source, the request and the response that are waiting on the
//! bridge, and whether the source was refused and is owed a retry. Slot 0 is
//! the system source: while either of its slots is occupied every source is
//! treated as blocked.

use serde::Serialize;
use tracing::debug;

use crate::packet::SourceId;
use crate::transaction::TxnId;

/// Which half of the exchange a blocking record covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PacketKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SourceSlots {
    blocked_request: Option<TxnId>,
    blocked_response: Option<TxnId>,
    retry_needed: bool,
}

impl SourceSlots {
    fn slot(&self, kind: PacketKind) -> Option<TxnId> {
        match kind {
            PacketKind::Request => self.blocked_request,
            PacketKind::Response => self.blocked_response,
        }
    }

    fn slot_mut(&mut self, kind: PacketKind) -> &mut Option<TxnId> {
        match kind {
            PacketKind::Request => &mut self.blocked_request,
            PacketKind::Response => &mut self.blocked_response,
        }
    }
}

/// Per-source blocking state with system-source priority
#[derive(Debug, Clone)]
pub struct BackpressureCoordinator {
    slots: Vec<SourceSlots>,
}

impl BackpressureCoordinator {
    /// Create empty slots for `source_count` sources, system source included
    pub fn new(source_count: usize) -> Self {
        Self {
            slots: vec![SourceSlots::default(); source_count.max(1)],
        }
    }

    pub fn source_count(&self) -> usize {
        self.slots.len()
    }

    /// Every source id the coordinator knows, system first
    pub fn sources(&self) -> impl Iterator<Item = SourceId> {
        (0..self.slots.len()).map(|i| SourceId::new(i as u16))
    }

    /// Whether the system source holds anything, which blocks everyone
    pub fn system_blocked(&self) -> bool {
        let system = &self.slots[0];
        system.blocked_request.is_some() || system.blocked_response.is_some()
    }

    /// Whether `source` may not start a new exchange of `kind`
    pub fn is_blocked(&self, source: SourceId, kind: PacketKind) -> bool {
        self.system_blocked()
            || self
                .slots
                .get(source.index())
                .is_some_and(|slots| slots.slot(kind).is_some())
    }

    /// The transaction recorded for `source`, if any
    pub fn blocking(&self, source: SourceId, kind: PacketKind) -> Option<TxnId> {
        self.slots.get(source.index()).and_then(|slots| slots.slot(kind))
    }

    /// Set or clear the blocking record of `source`
    ///
    /// Sources beyond the configured count are folded onto the system slot.
    pub fn record_blocking(&mut self, source: SourceId, txn: Option<TxnId>, kind: PacketKind) {
        let index = self.slot_index(source);
        debug!(
            "{:?} block for {} -> {:?}",
            kind,
            SourceId::new(index as u16),
            txn
        );
        *self.slots[index].slot_mut(kind) = txn;
    }

    /// Source whose `kind` slot holds `txn`
    pub fn owner_of(&self, txn: TxnId, kind: PacketKind) -> Option<SourceId> {
        self.slots
            .iter()
            .position(|slots| slots.slot(kind) == Some(txn))
            .map(|i| SourceId::new(i as u16))
    }

    /// Whether `txn` is recorded as blocking `kind` for some source
    pub fn is_owned_by(&self, txn: TxnId, kind: PacketKind) -> bool {
        self.owner_of(txn, kind).is_some()
    }

    pub fn mark_retry_needed(&mut self, source: SourceId, needed: bool) {
        let index = self.slot_index(source);
        self.slots[index].retry_needed = needed;
    }

    pub fn retry_needed(&self, source: SourceId) -> bool {
        self.slots
            .get(source.index())
            .is_some_and(|slots| slots.retry_needed)
    }

    /// One blocked response, system slot first then by source id
    pub fn any_blocked_response(&self) -> Option<(SourceId, TxnId)> {
        self.slots.iter().enumerate().find_map(|(i, slots)| {
            slots
                .blocked_response
                .map(|txn| (SourceId::new(i as u16), txn))
        })
    }

    fn slot_index(&self, source: SourceId) -> usize {
        if source.index() < self.slots.len() {
            source.index()
        } else {
            0
        }
    }
}
