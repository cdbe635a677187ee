//! End-to-end scenarios through adapter, coordinator and nodes

use core::time::Duration;
use std::collections::BTreeSet;

use txnbridge_core::{
    shared, AccessMode, AddressRange, Admission, BindingMode, BoundaryAdapter, NodeState, Packet,
    PacketKind, RecordingInitiator, ResponseStatus, RouterNode, SimpleBus, SimpleMemory,
    Simulation, SourceId, SourceMap, SystemConfig, Target, Transaction,
};

use test_utils::{
    assert_drained, core_requestor, core_source, multi_core, random_traffic, run_traffic,
    shared_node, MEM_BASE, SYSTEM_REQUESTOR, UART_BASE,
};

fn ns(n: u64) -> Duration {
    Duration::from_nanos(n)
}

// ----------------------------------------------------------------------------
// Atomic and Debug Paths
// ----------------------------------------------------------------------------

#[test]
fn test_atomic_request_completes_synchronously() {
    let mut sim = multi_core(1, RecordingInitiator::new());
    let write = Packet::write(1, core_requestor(0), MEM_BASE + 0x40, vec![0xca, 0xfe])
        .with_mode(AccessMode::Atomic);
    let Admission::Completed(response) = sim.submit(write).unwrap() else {
        panic!("atomic write must complete inline");
    };
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.source, core_source(0));

    let read = Packet::read(2, core_requestor(0), MEM_BASE + 0x40, 2).with_mode(AccessMode::Atomic);
    let Admission::Completed(response) = sim.submit(read).unwrap() else {
        panic!("atomic read must complete inline");
    };
    assert_eq!(response.data, vec![0xca, 0xfe]);

    assert_eq!(sim.kernel().pool.stats().allocated, 0);
    assert!(sim.kernel().queue.is_empty());
    assert!(!sim
        .adapter()
        .coordinator()
        .is_blocked(core_source(0), PacketKind::Request));
    assert_eq!(sim.adapter().nodes()[1].stats().atomic, 2);
}

#[test]
fn test_atomic_latency_depends_on_executor() {
    let mut config = SystemConfig::multi_core(1);
    config.memory.latency_ns = 7;
    config.fabric.hop_latency_ns = 3;
    let mut sim = config.build(RecordingInitiator::new()).unwrap();

    let via_bus = Packet::read(1, SYSTEM_REQUESTOR, MEM_BASE, 4).with_mode(AccessMode::Atomic);
    let direct = Packet::read(2, core_requestor(0), MEM_BASE, 4).with_mode(AccessMode::Atomic);

    match (sim.submit(via_bus).unwrap(), sim.submit(direct).unwrap()) {
        (Admission::Completed(bus), Admission::Completed(local)) => {
            assert_eq!(bus.latency, ns(10));
            assert_eq!(local.latency, ns(7));
        }
        other => panic!("unexpected admissions {other:?}"),
    }
}

#[test]
fn test_debug_access_leaves_blocking_state_alone() {
    let mut sim = multi_core(1, RecordingInitiator::new());
    let timed = Packet::write(1, core_requestor(0), MEM_BASE, vec![1, 2, 3, 4]);
    assert_eq!(sim.submit(timed).unwrap(), Admission::Accepted);
    let blocking = sim
        .adapter()
        .coordinator()
        .blocking(core_source(0), PacketKind::Request);
    assert!(blocking.is_some());

    let peek = Packet::read(2, core_requestor(0), MEM_BASE, 4).with_mode(AccessMode::Debug);
    let Admission::Completed(response) = sim.submit(peek).unwrap() else {
        panic!("debug read must complete inline");
    };
    // the timed write has not executed yet
    assert_eq!(response.data, vec![0, 0, 0, 0]);

    let coordinator = sim.adapter().coordinator();
    assert_eq!(
        coordinator.blocking(core_source(0), PacketKind::Request),
        blocking
    );
    assert!(!coordinator.retry_needed(core_source(0)));
    assert_eq!(sim.adapter().stats().refused, 0);

    sim.run_until_idle().unwrap();
    assert_drained(&sim);
}

struct Truncating {
    range: AddressRange,
}

impl Target for Truncating {
    fn name(&self) -> &str {
        "truncating"
    }

    fn decodes(&self, address: u64) -> bool {
        self.range.contains(address)
    }

    fn transport(&mut self, txn: &mut Transaction) -> txnbridge_core::Result<Duration> {
        txn.set_status(ResponseStatus::Ok);
        Ok(Duration::ZERO)
    }

    fn transport_dbg(&mut self, txn: &mut Transaction) -> txnbridge_core::Result<usize> {
        Ok(txn.data_length().saturating_sub(1))
    }
}

#[test]
fn test_short_debug_transfer_is_fatal() {
    let mem = AddressRange::new(MEM_BASE, 0x100);
    let device = AddressRange::new(UART_BASE, 0x10);
    let memory = shared(SimpleMemory::new("memory", mem));
    let mut bus = SimpleBus::new("bus");
    bus.map(mem, memory.clone()).unwrap();
    bus.map(device, shared(Truncating { range: device })).unwrap();

    let node = RouterNode::router("router0", mem, memory, shared(bus), Default::default());
    let adapter = BoundaryAdapter::new(
        "bridge",
        vec![node],
        BindingMode::Shared,
        SourceMap::new(Vec::new()).unwrap(),
        RecordingInitiator::new(),
    );
    let mut sim = Simulation::new(adapter);

    let peek = Packet::read(1, SYSTEM_REQUESTOR, UART_BASE, 4).with_mode(AccessMode::Debug);
    let err = sim.submit(peek).unwrap_err();
    assert_eq!(err.reason(), "debug-transport-incomplete");
}

// ----------------------------------------------------------------------------
// Timed Path
// ----------------------------------------------------------------------------

#[test]
fn test_back_to_back_requests_serialise_at_one_node() {
    let mut sim = shared_node(2, RecordingInitiator::new());
    let first = Packet::write(1, core_requestor(0), MEM_BASE, vec![1]);
    let second = Packet::write(2, core_requestor(1), MEM_BASE + 1, vec![2]);
    assert_eq!(sim.submit(first).unwrap(), Admission::Accepted);
    assert_eq!(sim.submit(second).unwrap(), Admission::Accepted);

    sim.run_until(ns(5)).unwrap();
    let node = &sim.adapter().nodes()[0];
    assert_eq!(node.state(), NodeState::Executing);
    assert!(node.queued_request().is_some());

    // first response delivered and acknowledged at 35ns
    sim.run_until(ns(34)).unwrap();
    assert!(sim.adapter().nodes()[0].queued_request().is_some());
    assert!(sim
        .adapter()
        .coordinator()
        .is_blocked(core_source(1), PacketKind::Request));

    sim.run_until(ns(36)).unwrap();
    let node = &sim.adapter().nodes()[0];
    assert!(node.queued_request().is_none());
    assert!(node.in_flight().is_some());

    sim.run_until_idle().unwrap();
    let ids: Vec<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(sim.now(), ns(70));
    assert_eq!(sim.adapter().nodes()[0].stats().queued_requests, 1);
    assert_drained(&sim);
}

#[test]
fn test_refused_source_gets_exactly_one_retry() {
    let initiator = RecordingInitiator::new().with_auto_resubmit(false);
    let mut sim = multi_core(2, initiator);
    let source = core_source(0);

    let first = Packet::read(1, core_requestor(0), MEM_BASE, 4);
    assert_eq!(sim.submit(first).unwrap(), Admission::Accepted);
    for attempt in 0..3 {
        let again = Packet::read(2, core_requestor(0), MEM_BASE + 4, 4);
        assert_eq!(
            sim.submit(again).unwrap(),
            Admission::RetryLater,
            "attempt {attempt}"
        );
    }
    assert!(sim.adapter().coordinator().retry_needed(source));
    assert_eq!(sim.upstream().retries_for(source), 0);
    assert_eq!(sim.kernel().pool.stats().allocated, 1);

    sim.run_until_idle().unwrap();
    assert_eq!(sim.upstream().retries_for(source), 1);
    assert_eq!(sim.upstream().retries().len(), 1);
    assert_eq!(sim.upstream().waiting(source), 3);
    assert_eq!(sim.adapter().stats().refused, 3);
    assert_drained(&sim);
}

#[test]
fn test_resubmitted_requests_all_complete() {
    let mut sim = multi_core(2, RecordingInitiator::new());
    for id in 1..=3 {
        let packet = Packet::read(id, core_requestor(0), MEM_BASE + id * 4, 4);
        sim.submit(packet).unwrap();
    }

    sim.run_until_idle().unwrap();
    let ids: Vec<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(sim.upstream().retries_for(core_source(0)), 2);
    assert_drained(&sim);
}

#[test]
fn test_out_of_range_request_is_fatal_and_stateless() {
    let mut sim = multi_core(1, RecordingInitiator::new());
    let stray = Packet::read(1, core_requestor(0), 0x4000_0000, 4);
    let err = sim.submit(stray).unwrap_err();
    assert_eq!(err.reason(), "address-out-of-range");
    assert!(err.to_string().contains("router1"));

    assert_eq!(sim.kernel().pool.live(), 0);
    assert!(sim.kernel().queue.is_empty());
    assert!(!sim
        .adapter()
        .coordinator()
        .is_blocked(core_source(0), PacketKind::Request));
    for node in sim.adapter().nodes() {
        assert_eq!(node.state(), NodeState::Idle);
    }
}

#[test]
fn test_system_block_refuses_every_source() {
    let mut sim = multi_core(2, RecordingInitiator::new());
    let system = Packet::write(1, SYSTEM_REQUESTOR, MEM_BASE, vec![9; 8]);
    assert_eq!(sim.submit(system).unwrap(), Admission::Accepted);
    assert!(sim.adapter().coordinator().system_blocked());

    for core in 0..2 {
        let packet = Packet::read(10 + core as u64, core_requestor(core), MEM_BASE, 8);
        assert_eq!(sim.submit(packet).unwrap(), Admission::RetryLater);
        assert_eq!(
            sim.adapter()
                .coordinator()
                .blocking(core_source(core), PacketKind::Request),
            None
        );
    }

    sim.run_until_idle().unwrap();
    assert_eq!(sim.upstream().retries_for(core_source(0)), 1);
    assert_eq!(sim.upstream().retries_for(core_source(1)), 1);
    assert_eq!(sim.upstream().retries_for(SourceId::SYSTEM), 0);
    assert_eq!(sim.upstream().responses().len(), 3);
    assert_drained(&sim);
}

#[test]
fn test_invalidate_answers_while_source_is_blocked() {
    let mut sim = multi_core(1, RecordingInitiator::new());
    sim.submit(Packet::read(1, core_requestor(0), MEM_BASE, 4))
        .unwrap();
    let admission = sim
        .submit(Packet::invalidate(2, core_requestor(0), MEM_BASE))
        .unwrap();
    assert!(matches!(admission, Admission::Completed(_)));
    assert_eq!(sim.adapter().stats().invalidations, 1);
    assert_eq!(sim.adapter().stats().refused, 0);
    sim.run_until_idle().unwrap();
    assert_drained(&sim);
}

#[test]
fn test_payload_delay_postpones_the_request() {
    let mut sim = multi_core(1, RecordingInitiator::new());
    let packet = Packet::read(1, core_requestor(0), MEM_BASE, 4).with_payload_delay(ns(100));
    sim.submit(packet).unwrap();

    sim.run_until(ns(50)).unwrap();
    assert_eq!(sim.adapter().nodes()[1].state(), NodeState::RequestPending);

    sim.run_until_idle().unwrap();
    assert_eq!(sim.now(), ns(135));
    assert_drained(&sim);
}

#[test]
fn test_fabric_device_reached_through_router() {
    let mut sim = multi_core(1, RecordingInitiator::new());
    sim.submit(Packet::write(1, core_requestor(0), UART_BASE + 4, vec![0x41]))
        .unwrap();
    sim.run_until_idle().unwrap();

    let response = &sim.upstream().responses()[0];
    assert!(response.status.is_ok());
    assert_eq!(response.address, UART_BASE + 4);
    assert_eq!(response.data, vec![0x41]);
    assert_drained(&sim);
}

#[test]
fn test_full_shared_node_refuses_and_retries_once() {
    let mut sim = shared_node(3, RecordingInitiator::new());
    for core in 0..2 {
        let packet = Packet::read(core as u64, core_requestor(core), MEM_BASE, 4);
        assert_eq!(sim.submit(packet).unwrap(), Admission::Accepted);
    }

    // two requests already head for router0, a third would not fit
    let third = Packet::read(2, core_requestor(2), MEM_BASE + 8, 4);
    assert_eq!(sim.submit(third).unwrap(), Admission::RetryLater);
    assert!(sim.adapter().coordinator().retry_needed(core_source(2)));
    assert_eq!(sim.kernel().pool.stats().allocated, 2);

    sim.run_until_idle().unwrap();
    let ids: Vec<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(sim.upstream().retries_for(core_source(2)), 1);
    assert_eq!(sim.upstream().retries().len(), 1);
    assert_eq!(sim.adapter().stats().refused, 1);
    assert_eq!(sim.adapter().nodes()[0].stats().queued_requests, 2);
    assert_eq!(sim.now(), ns(105));
    assert_drained(&sim);
}

#[test]
fn test_single_core_preset_serves_system_and_core() {
    let mut sim = SystemConfig::single_core()
        .build(RecordingInitiator::new())
        .unwrap();
    sim.schedule_arrival(Packet::read(0, core_requestor(0), MEM_BASE, 4), ns(0));
    sim.schedule_arrival(Packet::read(1, core_requestor(0), MEM_BASE + 4, 4), ns(11));
    sim.schedule_arrival(Packet::read(2, SYSTEM_REQUESTOR, MEM_BASE + 8, 4), ns(12));

    sim.run_until_idle().unwrap();
    let ids: Vec<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(sim.upstream().retries_for(SourceId::SYSTEM), 1);
    assert_eq!(sim.upstream().retries().len(), 1);
    assert_eq!(sim.now(), ns(105));
    assert_drained(&sim);
}

// ----------------------------------------------------------------------------
// Response Backpressure
// ----------------------------------------------------------------------------

#[test]
fn test_refused_response_is_offered_again() {
    let mut sim = multi_core(1, RecordingInitiator::new().refusing_responses(1));
    sim.submit(Packet::read(1, core_requestor(0), MEM_BASE, 4))
        .unwrap();
    sim.run_until_idle().unwrap();

    assert_eq!(sim.upstream().responses().len(), 1);
    assert_eq!(sim.upstream().refused_responses(), 1);
    assert_eq!(sim.adapter().stats().blocked_responses, 1);
    assert_drained(&sim);
}

#[test]
fn test_response_drain_stops_when_refused_again() {
    let initiator = RecordingInitiator::new()
        .refusing_responses(2)
        .with_auto_response_retry(false);
    let mut sim = multi_core(1, initiator);
    sim.submit(Packet::read(1, core_requestor(0), MEM_BASE, 4))
        .unwrap();
    sim.run_until_idle().unwrap();

    let blocked = sim.adapter().coordinator().any_blocked_response();
    assert!(matches!(blocked, Some((source, _)) if source == core_source(0)));
    assert_eq!(
        sim.adapter().nodes()[1].state(),
        NodeState::ResponsePending
    );

    sim.recv_resp_retry().unwrap();
    assert_eq!(sim.adapter().coordinator().any_blocked_response(), blocked);
    assert!(sim.upstream().responses().is_empty());

    sim.recv_resp_retry().unwrap();
    sim.run_until_idle().unwrap();
    assert_eq!(sim.upstream().responses().len(), 1);
    assert_drained(&sim);
}

#[test]
fn test_blocked_system_response_blocks_other_sources() {
    let initiator = RecordingInitiator::new()
        .refusing_responses(1)
        .with_auto_response_retry(false);
    let mut sim = multi_core(1, initiator);
    sim.submit(Packet::write(1, SYSTEM_REQUESTOR, MEM_BASE, vec![3]))
        .unwrap();
    sim.run_until_idle().unwrap();
    assert!(sim.adapter().coordinator().system_blocked());

    let packet = Packet::read(2, core_requestor(0), MEM_BASE, 1);
    assert_eq!(sim.submit(packet).unwrap(), Admission::RetryLater);

    sim.recv_resp_retry().unwrap();
    assert_eq!(sim.upstream().retries_for(core_source(0)), 1);
    sim.run_until_idle().unwrap();

    let ids: BTreeSet<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids, BTreeSet::from([1, 2]));
    assert_eq!(sim.upstream().responses()[1].data, vec![3]);
    assert_drained(&sim);
}

// ----------------------------------------------------------------------------
// Liveness
// ----------------------------------------------------------------------------

#[test]
fn test_random_traffic_completes_every_packet() {
    let mut sim = multi_core(4, RecordingInitiator::new());
    run_traffic(&mut sim, random_traffic(7, 4, 300)).unwrap();

    let ids: BTreeSet<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 300);
    assert_eq!(sim.upstream().responses().len(), 300);

    let stats = sim.stats();
    for (name, node) in &stats.nodes {
        assert_eq!(node.accepted, node.acknowledged, "{name}");
        assert_eq!(node.executed, node.delivered, "{name}");
    }
    assert_eq!(stats.pool.allocated, stats.pool.freed);
    assert_drained(&sim);
}

#[test]
fn test_random_traffic_completes_on_a_shared_node() {
    let mut sim = shared_node(3, RecordingInitiator::new().refusing_responses(3));
    run_traffic(&mut sim, random_traffic(11, 3, 300)).unwrap();

    let ids: BTreeSet<_> = sim.upstream().responses().iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 300);
    assert_eq!(sim.upstream().responses().len(), 300);
    assert!(sim.adapter().stats().refused > 0);

    let node = &sim.stats().nodes[0].1;
    assert_eq!(node.accepted, node.acknowledged);
    assert!(node.peak_occupancy <= 3);
    assert_drained(&sim);
}
