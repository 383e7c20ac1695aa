//! Request setup, processing and completion on single nodes and short chains

mod common;

use camnode::backend::DevicePacket;
use camnode::config::NodeKind;
use camnode::fence::{FenceProvider, FenceResult};
use camnode::metadata::{node_complete_tag, MetadataPool};
use camnode::pipeline::{HardwareNode, HostEvent, PerRequestNodeStatus};
use camnode::NodeError;
use common::builders::NodeConfigBuilder;
use common::mock_helpers::{idle_plugin, recording_device, MockPlugin};
use common::{capture_request, Harness};
use std::sync::Arc;
use std::thread;

#[test]
fn test_sink_requests_complete_within_buffer_budget() {
    let h = Harness::new();
    let mut config = NodeConfigBuilder::new("sink").sink(0, 0).build();
    config.outputs[0].max_image_buffers = 4;
    let node = h.node(&config);
    h.finalize(&[&node]);

    let mut fences = Vec::new();
    for request_id in 0..4 {
        h.submit(capture_request(&[config.clone()], request_id));
        node.setup_request(request_id).unwrap();
        fences.push(node.output_fence(0, request_id).expect("sink fence"));
    }
    assert_eq!(node.unresolved_requests().len(), 4);

    for (request_id, fence) in fences.into_iter().enumerate() {
        h.fences.signal(fence, FenceResult::Success).unwrap();
        let request_id = request_id as u64;
        assert!(node.is_request_complete(request_id));
        assert_eq!(node.request_status(request_id), Some(PerRequestNodeStatus::Success));
        assert_eq!(h.host.ledger().total(HostEvent::SinkSignaled, request_id), 1);
        assert_eq!(h.host.ledger().total(HostEvent::RequestIdDone, request_id), 1);
        assert_eq!(h.fences.release_count(fence), 1);
    }

    // Slot 4 was never touched
    assert_eq!(node.request_status(4), None);
    assert_eq!(node.dump_state().slots.len(), 4);
    assert!(node.unresolved_requests().is_empty());
    assert_eq!(h.fences.live_fences(), 0);
}

#[test]
fn test_output_handler_reuse_waits_for_previous_request() {
    let h = Harness::new();
    let mut config = NodeConfigBuilder::new("sink").sink(0, 0).build();
    config.outputs[0].max_image_buffers = 4;
    let node = h.node(&config);
    h.finalize(&[&node]);

    for request_id in 0..5 {
        h.submit(capture_request(&[config.clone()], request_id));
    }
    for request_id in 0..4 {
        node.setup_request(request_id).unwrap();
    }

    // Request 4 maps onto the handler still held by request 0
    assert!(!node.is_slot_available(4));
    let err = node.setup_request(4).unwrap_err();
    assert!(matches!(err.root(), NodeError::Resource(_)), "{}", err);
    assert_eq!(node.request_status(4), Some(PerRequestNodeStatus::Error));

    let fence = node.output_fence(0, 0).unwrap();
    h.fences.signal(fence, FenceResult::Success).unwrap();
    assert!(node.is_request_complete(0));
}

#[test]
fn test_ring_slot_held_by_unresolved_request() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("sink").sink(0, 0).build();
    let node = h.node(&config);
    h.finalize(&[&node]);
    h.submit(capture_request(&[config.clone()], 0));
    h.submit(capture_request(&[config.clone()], 8));

    node.setup_request(0).unwrap();
    assert!(!node.is_slot_available(8));
    let err = node.setup_request(8).unwrap_err();
    assert!(matches!(err.root(), NodeError::Resource(_)), "{}", err);
    // The occupant is left alone
    assert_eq!(node.request_status(0), Some(PerRequestNodeStatus::Setup));

    let err = node.setup_request(0).unwrap_err();
    assert!(matches!(err.root(), NodeError::InvalidState(_)), "{}", err);
}

#[test]
fn test_chain_releases_parent_on_child_completion() {
    let h = Harness::new();
    let sensor_config = NodeConfigBuilder::new("sensor").output(0).build();
    let ife_config = NodeConfigBuilder::new("ife")
        .input(0, "sensor", 0)
        .sink(1, 0)
        .publish_tag(0x10001)
        .build();
    let sensor = h.node(&sensor_config);
    let ife = h.node(&ife_config);
    h.link(&ife, 0, &sensor, 0);
    sensor.set_output_stream_mask(0, 0b1).unwrap();
    h.finalize(&[&sensor, &ife]);

    h.submit(capture_request(&[sensor_config, ife_config], 0));
    sensor.setup_request(0).unwrap();
    ife.setup_request(0).unwrap();

    let sensor_fence = sensor.output_fence(0, 0).unwrap();
    assert_eq!(ife.input_fences(0), vec![sensor_fence]);
    // Own reference plus one consumer
    assert_eq!(sensor.fence_reference_count(0, 0), Some(2));

    sensor.process_request(0, 0).unwrap();
    assert!(sensor.is_request_complete(0));
    assert_eq!(sensor.fence_reference_count(0, 0), Some(1));
    assert_eq!(h.host.ledger().count(HostEvent::NonSinkSignaled, sensor.id(), 0), 1);

    ife.process_request(0, 0).unwrap();
    assert!(ife.is_request_complete(0));
    assert_eq!(sensor.fence_reference_count(0, 0), None);
    assert_eq!(h.fences.release_count(sensor_fence), 1);
    assert_eq!(h.fences.live_fences(), 0);
    assert_eq!(h.host.ledger().total(HostEvent::RequestIdDone, 0), 2);

    assert!(h.metadata.is_published(0, 0x10001));
    assert!(h.metadata.is_published(0, node_complete_tag(ife.id())));
    assert!(ife.processing_time(0).is_some());
}

#[test]
fn test_loopback_input_reads_previous_request() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("tnr")
        .lagged_input(0, "tnr", 0, 1)
        .output(0)
        .sink(1, 0)
        .build();
    let node = h.node(&config);
    h.link(&node, 0, &node, 0);
    h.finalize(&[&node]);

    for request_id in 0..2 {
        h.submit(capture_request(&[config.clone()], request_id));
    }

    node.setup_request(0).unwrap();
    // Nothing to read behind the first request
    assert!(node.input_fences(0).is_empty());
    let first = node.output_fence(0, 0).unwrap();
    node.process_request(0, 0).unwrap();
    assert!(node.is_request_complete(0));
    assert_eq!(node.fence_reference_count(0, 0), Some(1));

    node.setup_request(1).unwrap();
    assert_eq!(node.input_fences(1), vec![first]);
    node.process_request(1, 0).unwrap();
    assert!(node.is_request_complete(1));

    assert_eq!(node.fence_reference_count(0, 0), None);
    assert_eq!(h.fences.release_count(first), 1);
    // Request 1's feedback output waits for request 2
    assert_eq!(node.fence_reference_count(0, 1), Some(1));
}

#[test]
fn test_node_disabled_when_no_stream_needs_it() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("jpeg").sink(0, 1).build();
    let node = h.node(&config);
    h.finalize(&[&node]);

    h.submit(camnode::CaptureRequest::new(0, 0b1));
    node.setup_request(0).unwrap();

    assert!(!node.is_enabled_for_request(0));
    assert!(node.is_request_complete(0));
    assert!(node.output_fence(0, 0).is_none());
    assert_eq!(h.host.ledger().total(HostEvent::RequestIdDone, 0), 1);
    assert_eq!(h.fences.created_count(), 0);
}

#[test]
fn test_completion_latches_fire_once_under_contention() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("sink").sink(0, 0).build();
    let node = h.node(&config);
    h.finalize(&[&node]);
    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let node = Arc::clone(&node);
            thread::spawn(move || {
                node.process_partial_metadata_done(0);
                node.process_metadata_done(0);
                node.process_request_id_done(0);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ledger = h.host.ledger();
    assert_eq!(ledger.count(HostEvent::PartialMetadataDone, node.id(), 0), 1);
    assert_eq!(ledger.count(HostEvent::MetadataDone, node.id(), 0), 1);
    assert_eq!(ledger.count(HostEvent::RequestIdDone, node.id(), 0), 1);
}

#[test]
fn test_failed_initialize_destroys_node() {
    let h = Harness::new();
    let mut plugin = MockPlugin::new();
    plugin
        .expect_initialize()
        .times(1)
        .returning(|_| Err(NodeError::NoMemory("no command buffers".to_string())));
    plugin.expect_execute_process_request().never();

    let config = NodeConfigBuilder::new("ife").sink(0, 0).build();
    let err = h.node_with(&config, Arc::new(plugin)).unwrap_err();
    assert!(matches!(err.root(), NodeError::NoMemory(_)), "{}", err);
}

#[test]
fn test_plugin_error_fails_and_flushes_request() {
    let h = Harness::new();
    let mut plugin = MockPlugin::new();
    plugin
        .expect_initialize()
        .returning(|_| Ok(Default::default()));
    plugin
        .expect_execute_process_request()
        .times(1)
        .returning(|_, _| Err(NodeError::Failed("device hung".to_string())));
    plugin.expect_cancel_request().times(1).return_const(());

    let config = NodeConfigBuilder::new("ife").sink(0, 0).build();
    let node = h.node_with(&config, Arc::new(plugin)).unwrap();
    h.finalize(&[&node]);
    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();

    let err = node.process_request(0, 0).unwrap_err();
    assert!(matches!(err.root(), NodeError::Failed(_)), "{}", err);
    assert_eq!(node.request_status(0), Some(PerRequestNodeStatus::Error));
    assert!(node.is_request_complete(0));

    let ledger = h.host.ledger();
    assert_eq!(ledger.total(HostEvent::SinkError, 0), 1);
    assert_eq!(ledger.total(HostEvent::RequestError, 0), 1);
    assert_eq!(ledger.total(HostEvent::RequestIdDone, 0), 1);
}

#[test]
fn test_processing_skipped_for_errored_request() {
    let h = Harness::new();
    let mut plugin = MockPlugin::new();
    plugin
        .expect_initialize()
        .returning(|_| Ok(Default::default()));
    plugin.expect_execute_process_request().never();

    let config = NodeConfigBuilder::new("ife").sink(0, 0).build();
    let node = h.node_with(&config, Arc::new(plugin)).unwrap();
    h.finalize(&[&node]);
    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();

    h.host.mark_error(0);
    node.process_request(0, 0).unwrap();
    assert_eq!(node.request_status(0), Some(PerRequestNodeStatus::Setup));
}

#[test]
fn test_hardware_node_submits_output_fences() {
    let h = Harness::new();
    let (device, packets) = recording_device();
    let plugin = HardwareNode::new(Arc::new(device));
    let config = NodeConfigBuilder::new("ife")
        .kind(NodeKind::Hardware)
        .sink(0, 0)
        .build();
    let node = h.node_with(&config, Arc::new(plugin)).unwrap();
    assert_eq!(node.cmd_buffer_manager_count(), 1);
    h.finalize(&[&node]);
    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();
    node.process_request(0, 0).unwrap();

    let packet: DevicePacket = packets.try_recv().expect("packet submitted");
    let fence = node.output_fence(0, 0).unwrap();
    assert_eq!(packet.node, "ife");
    assert_eq!(packet.request_id, 0);
    assert_eq!(packet.fences, vec![fence]);
    assert!(packet.cmd_buffer.is_some());
    assert_eq!(node.request_status(0), Some(PerRequestNodeStatus::Submit));

    h.fences.signal(fence, FenceResult::Success).unwrap();
    assert!(node.is_request_complete(0));
}

#[test]
fn test_deferred_init_joins_before_use() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("stats")
        .sink(0, 0)
        .deferred_init()
        .build();
    let node = h.node_with(&config, Arc::new(idle_plugin())).unwrap();
    node.finalize_initialization().unwrap();
    // A second join has nothing left to wait for
    node.finalize_initialization().unwrap();
    h.finalize(&[&node]);

    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();
    node.process_request(0, 0).unwrap();
    // The plugin never signals, so the request stays with the device
    assert_eq!(node.request_status(0), Some(PerRequestNodeStatus::Submit));
    assert!(!node.is_request_complete(0));

    node.flush(0).unwrap();
    assert!(node.is_request_complete(0));
    assert_eq!(node.request_status(0), Some(PerRequestNodeStatus::Cancelled));
}
