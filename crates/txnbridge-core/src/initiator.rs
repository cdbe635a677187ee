//! Recording initiator
//!
//! An [`Upstream`] that keeps every response and retry it is given. Refused
//! requests are held per source and handed back for resubmission when that
//! source's retry arrives. It can be told to refuse a number of responses to
//! exercise the response-blocking path.

use alloc::collections::BTreeMap;

use crate::adapter::Upstream;
use crate::packet::{Packet, PacketResponse, SourceId};

#[derive(Debug)]
pub struct RecordingInitiator {
    responses: Vec<PacketResponse>,
    retries: Vec<SourceId>,
    waiting: BTreeMap<SourceId, Vec<Packet>>,
    resubmit: Vec<Packet>,
    refuse_responses: usize,
    refused_responses: usize,
    response_retry_pending: bool,
    auto_resubmit: bool,
    auto_response_retry: bool,
}

impl Default for RecordingInitiator {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            retries: Vec::new(),
            waiting: BTreeMap::new(),
            resubmit: Vec::new(),
            refuse_responses: 0,
            refused_responses: 0,
            response_retry_pending: false,
            auto_resubmit: true,
            auto_response_retry: true,
        }
    }
}

impl RecordingInitiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` timed responses
    pub fn refusing_responses(mut self, count: usize) -> Self {
        self.refuse_responses = count;
        self
    }

    /// Resubmit a source's refused requests as soon as its retry arrives
    pub fn with_auto_resubmit(mut self, enabled: bool) -> Self {
        self.auto_resubmit = enabled;
        self
    }

    /// Ask for blocked responses again right after refusing one
    pub fn with_auto_response_retry(mut self, enabled: bool) -> Self {
        self.auto_response_retry = enabled;
        self
    }

    pub fn responses(&self) -> &[PacketResponse] {
        &self.responses
    }

    pub fn retries(&self) -> &[SourceId] {
        &self.retries
    }

    pub fn retries_for(&self, source: SourceId) -> usize {
        self.retries.iter().filter(|s| **s == source).count()
    }

    /// Refused requests not yet handed back
    pub fn waiting(&self, source: SourceId) -> usize {
        self.waiting.get(&source).map_or(0, Vec::len)
    }

    /// Responses turned away so far
    pub fn refused_responses(&self) -> usize {
        self.refused_responses
    }
}

impl Upstream for RecordingInitiator {
    fn send_timing_resp(&mut self, response: PacketResponse) -> bool {
        if self.refuse_responses > 0 {
            self.refuse_responses -= 1;
            self.refused_responses += 1;
            self.response_retry_pending = true;
            return false;
        }
        self.responses.push(response);
        true
    }

    fn send_retry_req(&mut self, source: SourceId) {
        self.retries.push(source);
        if self.auto_resubmit {
            if let Some(packets) = self.waiting.remove(&source) {
                self.resubmit.extend(packets);
            }
        }
    }

    fn request_refused(&mut self, source: SourceId, packet: Packet) {
        self.waiting.entry(source).or_default().push(packet);
    }

    fn completed_inline(&mut self, response: PacketResponse) {
        self.responses.push(response);
    }

    fn drain_resubmissions(&mut self) -> Vec<Packet> {
        core::mem::take(&mut self.resubmit)
    }

    fn wants_response_retry(&mut self) -> bool {
        if self.auto_response_retry && self.response_retry_pending {
            self.response_retry_pending = false;
            return true;
        }
        false
    }
}
