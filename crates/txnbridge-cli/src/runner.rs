//! Workload runner and report rendering

use std::fmt::Write as _;

use serde::Serialize;
use tracing::{info, warn};

use txnbridge_core::{PacketResponse, RecordingInitiator, RunStats, SystemConfig};

use crate::error::Result;
use crate::workload::Workload;

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workload: String,
    pub submitted: usize,
    pub completed: usize,
    /// Responses carrying an error status
    pub failed: usize,
    pub retries: usize,
    pub refused_responses: usize,
    pub stats: RunStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<PacketResponse>,
}

/// Run `workload` on a system built from `config` until nothing is left to do
pub fn run(
    config: &SystemConfig,
    workload: &Workload,
    seed: Option<u64>,
    keep_responses: bool,
) -> Result<RunReport> {
    let packets = workload.packets(seed)?;
    let submitted = packets.len();

    let mut sim = config.build(RecordingInitiator::new())?;
    for (packet, at) in packets {
        sim.schedule_arrival(packet, at);
    }
    sim.run_until_idle()?;

    let initiator = sim.upstream();
    let completed = initiator.responses().len();
    if completed != submitted {
        warn!("{} of {} packets never completed", submitted - completed, submitted);
    }
    let failed = initiator
        .responses()
        .iter()
        .filter(|r| !r.status.is_ok())
        .count();

    let stats = sim.stats();
    info!(
        "run finished at {} ns after {} events",
        stats.end_time_ns, stats.events
    );

    Ok(RunReport {
        workload: workload.metadata.name.clone(),
        submitted,
        completed,
        failed,
        retries: initiator.retries().len(),
        refused_responses: initiator.refused_responses(),
        stats,
        responses: if keep_responses {
            initiator.responses().to_vec()
        } else {
            Vec::new()
        },
    })
}

pub fn render_json(report: &RunReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    let name = if report.workload.is_empty() {
        "unnamed"
    } else {
        report.workload.as_str()
    };
    let stats = &report.stats;

    let _ = writeln!(out, "workload:    {name}");
    let _ = writeln!(
        out,
        "packets:     {} submitted, {} completed, {} failed",
        report.submitted, report.completed, report.failed
    );
    let _ = writeln!(out, "end time:    {} ns ({} events)", stats.end_time_ns, stats.events);
    let _ = writeln!(
        out,
        "adapter:     {} timed, {} atomic, {} debug, {} invalidations",
        stats.adapter.timed_requests,
        stats.adapter.atomic_requests,
        stats.adapter.debug_requests,
        stats.adapter.invalidations
    );
    let _ = writeln!(
        out,
        "backpressure: {} refused, {} retries, {} blocked responses",
        stats.adapter.refused, report.retries, stats.adapter.blocked_responses
    );
    let _ = writeln!(
        out,
        "pool:        {} allocated, {} freed, peak {} live",
        stats.pool.allocated, stats.pool.freed, stats.pool.peak_live
    );

    for (name, node) in &stats.nodes {
        let _ = writeln!(
            out,
            "  {name:<10} executed {:>5}  queued req {:>4}  queued resp {:>4}  peak {}",
            node.executed, node.queued_requests, node.queued_responses, node.peak_occupancy
        );
    }

    if !report.responses.is_empty() {
        let _ = writeln!(out, "responses:");
        for response in &report.responses {
            let _ = writeln!(
                out,
                "  #{:<5} {:<7} {:#010x} {:?} {} [{:?}]",
                response.id,
                response.source.to_string(),
                response.address,
                response.command,
                hex::encode(&response.data),
                response.status
            );
        }
    }
    out
}
