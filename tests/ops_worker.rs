//! Ops worker behavior on a scripted bus: bootstrap, recovery, flush
//! triggering, notification handling, and failure surfacing.

mod common;

use std::time::Duration;

use common::{Cluster, WAIT_TIMEOUT, bytes, fold, queue_for, wait_for};
use mirrormap::MapError;
use mirrormap::core::{ClientId, OP_FLUSH_REQUEST, OpMessage};
use mirrormap::worker::{SharedMap, SteadyState};

#[test]
fn empty_bootstrap_goes_steady() {
    let cluster = Cluster::new(1, 3);
    let map = SharedMap::new();
    let (worker, _clean_rx) = cluster.ops_worker(ClientId::new(1), [0], map.clone());
    let queues = worker.flush_queues();

    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    assert!(map.is_empty());
    assert_eq!(queue_for(&queues, 0).max_add_offset(), -1);
    handle.stop().unwrap();
}

#[test]
fn recovery_replays_data_then_tails_ops() {
    // Three puts were flushed up to ops offset 2 / data offset 1; the
    // notification at ops offset 3 is the recovery anchor.
    let cluster = Cluster::new(1, 3);
    let flusher = ClientId::new(0xf);

    cluster.publish_op(0, Some("a"), &OpMessage::put(flusher, 1, bytes("1")));
    cluster.publish_op(0, Some("b"), &OpMessage::put(flusher, 2, bytes("2")));
    cluster.publish_op(0, Some("a"), &OpMessage::put(flusher, 3, bytes("3")));
    cluster.publish_op(0, None, &OpMessage::flush_notification(flusher, 2, 1));
    cluster.publish_data(0, "a", Some("3"));
    cluster.publish_data(0, "b", Some("2"));

    let map = SharedMap::new();
    let (worker, clean_rx) = cluster.ops_worker(ClientId::new(1), [0], map.clone());
    let queues = worker.flush_queues();

    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    assert_eq!(map.snapshot(), fold(&[("a", Some("3")), ("b", Some("2"))]));

    // The notification at offset 3 is reprocessed after the seek but its
    // boundary is already installed: dropped as stale, no clean request.
    let queue = queue_for(&queues, 0);
    assert!(wait_for(WAIT_TIMEOUT, || queue.max_add_offset() == 3));
    assert!(queue.is_empty());
    assert!(clean_rx.try_recv().is_err());

    handle.stop().unwrap();
}

#[test]
fn stale_end_offset_falls_back_to_earlier_flush_record() {
    // The data log really holds 11 records, but end offset queries are
    // pinned at 10. The newest notification claims data offset 10 and is
    // rejected (10 <= 10); the probe walks one window back and accepts the
    // earlier boundary at data offset 7.
    let cluster = Cluster::new(1, 3);
    let flusher = ClientId::new(0xf);

    cluster.publish_op(0, Some("k0"), &OpMessage::put(flusher, 1, bytes("x")));
    cluster.publish_op(0, None, &OpMessage::flush_notification(flusher, 0, 7));
    cluster.publish_op(0, Some("k1"), &OpMessage::put(flusher, 2, bytes("v1")));
    cluster.publish_op(0, Some("k2"), &OpMessage::put(flusher, 3, bytes("v2")));
    cluster.publish_op(0, None, &OpMessage::flush_notification(flusher, 3, 10));

    for i in 0..11 {
        cluster.publish_data(0, &format!("d{i}"), Some("v"));
    }
    cluster
        .bus
        .set_end_offset_override(&cluster.config.data_partition(0), Some(10));

    let map = SharedMap::new();
    let (worker, clean_rx) = cluster.ops_worker(ClientId::new(1), [0], map.clone());
    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    // Data replayed only up to offset 7, ops tailed from offset 1.
    let mut expected: Vec<(&str, Option<&str>)> = Vec::new();
    let keys: Vec<String> = (0..8).map(|i| format!("d{i}")).collect();
    for key in &keys {
        expected.push((key.as_str(), Some("v")));
    }
    expected.push(("k1", Some("v1")));
    expected.push(("k2", Some("v2")));
    assert_eq!(map.snapshot(), fold(&expected));
    assert!(!map.snapshot().contains_key(&bytes("d8")));

    // The newer foreign notification reached the applier after the seek.
    let clean = clean_rx.recv_timeout(WAIT_TIMEOUT).unwrap();
    assert_eq!(clean.op.flush_offset_ops, 3);

    handle.stop().unwrap();
}

#[test]
fn own_ops_at_period_boundaries_trigger_flush_requests() {
    let cluster = Cluster::new(1, 3);
    let client = ClientId::new(0xc);

    for (i, key) in ["k0", "k1", "k2", "k3", "k4", "k5", "k6"].iter().enumerate() {
        cluster.publish_op(0, Some(key), &OpMessage::put(client, i as u64, bytes("v")));
    }

    let map = SharedMap::new();
    let (worker, _clean_rx) = cluster.ops_worker(client, [0], map.clone());
    let queues = worker.flush_queues();

    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    assert!(wait_for(WAIT_TIMEOUT, || {
        cluster.flush_requests(0).len() == 2
    }));
    let requests = cluster.flush_requests(0);
    for req in &requests {
        assert_eq!(req.op_type, OP_FLUSH_REQUEST);
        assert_eq!(req.client_id, client);
        assert!(req.flush_offset_ops > 0);
        assert_eq!(req.flush_offset_ops % 3, 0);
        assert_eq!(req.last_clean_offset_ops(), -1);
    }
    assert_eq!(requests[0].flush_offset_ops, 3);
    assert_eq!(requests[1].flush_offset_ops, 6);

    // Every record produced exactly one queue add, in offset order, with
    // flush points at the period boundaries (offset 6 is also the batch
    // tail).
    let entries = queue_for(&queues, 0).entries();
    assert_eq!(entries.len(), 7);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.offset, i as i64);
        assert_eq!(entry.flush_point, entry.offset == 3 || entry.offset == 6);
    }

    handle.stop().unwrap();
}

#[test]
fn foreign_notification_updates_boundary_and_requests_clean() {
    let cluster = Cluster::new(1, 3);
    let me = ClientId::new(1);
    let peer = ClientId::new(2);

    let map = SharedMap::new();
    let (worker, clean_rx) = cluster.ops_worker(me, [0], map.clone());
    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    cluster.publish_op(0, None, &OpMessage::flush_notification(peer, 5, 2));

    let clean = clean_rx.recv_timeout(WAIT_TIMEOUT).unwrap();
    assert_eq!(clean.op.client_id, peer);
    assert_eq!(clean.op.flush_offset_ops, 5);
    assert_eq!(clean.partition, cluster.config.ops_partition(0));

    // Local map untouched, no flush request emitted.
    assert!(map.is_empty());
    assert!(cluster.flush_requests(0).is_empty());

    // An out-of-order (older) notification is dropped silently; a newer
    // one advances the boundary again.
    cluster.publish_op(0, None, &OpMessage::flush_notification(peer, 3, 1));
    cluster.publish_op(0, None, &OpMessage::flush_notification(peer, 9, 4));

    let clean = clean_rx.recv_timeout(WAIT_TIMEOUT).unwrap();
    assert_eq!(clean.op.flush_offset_ops, 9);
    assert!(clean_rx.try_recv().is_err());

    handle.stop().unwrap();
}

#[test]
fn corrupted_data_partition_fails_steady() {
    // The probe accepts a boundary at data offset 1 on the strength of a
    // transient end offset report of 2; the loader then sees the truth (an
    // empty partition) and fails recovery.
    let cluster = Cluster::new(1, 3);
    let flusher = ClientId::new(0xf);

    cluster.publish_op(0, None, &OpMessage::flush_notification(flusher, 2, 1));
    cluster
        .bus
        .push_end_offset_report(&cluster.config.data_partition(0), 2);

    let map = SharedMap::new();
    let (worker, _clean_rx) = cluster.ops_worker(ClientId::new(1), [0], map.clone());
    let steady = worker.steady_handle();
    let handle = worker.start().unwrap();

    let err = steady
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady fails within timeout")
        .unwrap_err();
    assert!(matches!(
        err,
        MapError::RecoveryCorrupted {
            end_offset: 0,
            flush_offset_data: 1,
            ..
        }
    ));
    assert!(matches!(steady.state(), SteadyState::Failed(_)));

    let result = handle.stop();
    assert!(matches!(result, Err(MapError::RecoveryCorrupted { .. })));
}

#[test]
fn cancellation_leaves_steady_pending() {
    // The end offset of the data partition is pinned above its real tail,
    // so the loader keeps polling for records that never come. Stopping
    // the worker mid-recovery must exit cleanly without resolving the
    // latch.
    let cluster = Cluster::new(1, 3);
    let flusher = ClientId::new(0xf);

    cluster.publish_op(0, None, &OpMessage::flush_notification(flusher, 2, 5));
    cluster
        .bus
        .set_end_offset_override(&cluster.config.data_partition(0), Some(6));

    let map = SharedMap::new();
    let (worker, _clean_rx) = cluster.ops_worker(ClientId::new(1), [0], map.clone());
    let steady = worker.steady_handle();

    let handle = worker.start().unwrap();
    assert!(steady.wait_timeout(Duration::from_millis(50)).is_none());
    handle.stop().unwrap();

    assert!(matches!(steady.state(), SteadyState::Pending));
}

#[test]
fn unknown_null_key_op_type_is_skipped() {
    let cluster = Cluster::new(1, 3);
    let peer = ClientId::new(2);

    let mut unknown = OpMessage::flush_notification(peer, 7, 3);
    unknown.op_type = b'Q';
    cluster.publish_op(0, None, &unknown);
    cluster.publish_op(0, Some("k"), &OpMessage::put(peer, 1, bytes("v")));

    let map = SharedMap::new();
    let (worker, clean_rx) = cluster.ops_worker(ClientId::new(1), [0], map.clone());
    let queues = worker.flush_queues();
    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    // The unknown record is skipped but still accounted in the queue; the
    // put after it applies normally.
    assert_eq!(map.snapshot(), fold(&[("k", Some("v"))]));
    assert_eq!(queue_for(&queues, 0).max_add_offset(), 1);
    assert!(clean_rx.try_recv().is_err());

    handle.stop().unwrap();
}

#[test]
fn multiple_partitions_recover_and_apply_independently() {
    let cluster = Cluster::new(2, 3);
    let flusher = ClientId::new(0xf);
    let peer = ClientId::new(2);

    // Partition 0 recovers from a flushed boundary, partition 1 from empty.
    cluster.publish_op(0, Some("a"), &OpMessage::put(flusher, 1, bytes("1")));
    cluster.publish_op(0, None, &OpMessage::flush_notification(flusher, 0, 0));
    cluster.publish_data(0, "a", Some("1"));
    cluster.publish_op(1, Some("b"), &OpMessage::put(peer, 1, bytes("2")));

    let map = SharedMap::new();
    let (worker, _clean_rx) = cluster.ops_worker(ClientId::new(1), [0, 1], map.clone());
    let handle = worker.start().unwrap();
    handle
        .steady()
        .wait_timeout(WAIT_TIMEOUT)
        .expect("steady within timeout")
        .unwrap();

    assert_eq!(
        map.snapshot(),
        fold(&[("a", Some("1")), ("b", Some("2"))])
    );

    // New ops on either partition keep applying after steady.
    cluster.publish_op(1, Some("b"), &OpMessage::remove_any(peer, 2));
    assert!(wait_for(WAIT_TIMEOUT, || {
        map.snapshot() == fold(&[("a", Some("1"))])
    }));

    handle.stop().unwrap();
}
