//! Fences shared by a composite group of outputs

mod common;

use camnode::buffer::Format;
use camnode::config::OutputPortConfig;
use camnode::fence::{FenceProvider, FenceResult};
use camnode::pipeline::{HostEvent, Node};
use common::builders::NodeConfigBuilder;
use common::{capture_request, Harness};
use std::sync::Arc;

struct Composite {
    h: Harness,
    parent: Arc<Node>,
    left: Arc<Node>,
    right: Arc<Node>,
}

/// Parent with two non-sink outputs in group 1, each read by one child
fn composite() -> Composite {
    let h = Harness::new();
    let parent_config = NodeConfigBuilder::new("ipe")
        .composite_output(0, 1)
        .composite_output(1, 1)
        .build();
    let left_config = NodeConfigBuilder::new("left")
        .input(0, "ipe", 0)
        .sink(2, 0)
        .build();
    let right_config = NodeConfigBuilder::new("right")
        .input(0, "ipe", 1)
        .sink(3, 0)
        .build();

    let parent = h.node(&parent_config);
    let left = h.node(&left_config);
    let right = h.node(&right_config);
    h.link(&left, 0, &parent, 0);
    h.link(&right, 0, &parent, 1);
    parent.set_output_stream_mask(0, 0b1).unwrap();
    parent.set_output_stream_mask(1, 0b1).unwrap();
    h.finalize(&[&parent, &left, &right]);

    h.submit(capture_request(&[parent_config, left_config, right_config], 0));
    Composite {
        h,
        parent,
        left,
        right,
    }
}

#[test]
fn test_group_fence_seeded_once_per_member() {
    let c = composite();
    c.parent.setup_request(0).unwrap();

    let fence = c.parent.output_fence(0, 0).unwrap();
    assert_eq!(c.parent.output_fence(1, 0), Some(fence));
    // Per member: one for the node, one for its consumer
    assert_eq!(c.parent.fence_reference_count(0, 0), Some(4));
    assert_eq!(c.parent.fence_reference_count(1, 0), Some(4));
    assert_eq!(c.h.fences.created_count(), 1);
}

#[test]
fn test_group_fence_released_after_last_reference() {
    let c = composite();
    c.parent.setup_request(0).unwrap();
    let fence = c.parent.output_fence(0, 0).unwrap();

    c.parent.process_request(0, 0).unwrap();
    assert!(c.parent.is_request_complete(0));
    assert_eq!(c.parent.fence_reference_count(0, 0), Some(2));
    assert_eq!(c.h.host.ledger().count(HostEvent::NonSinkSignaled, c.parent.id(), 0), 2);

    c.parent.release_output_reference(0, 0);
    assert_eq!(c.parent.fence_reference_count(0, 0), Some(1));
    assert_eq!(c.h.fences.release_count(fence), 0);

    c.parent.release_output_reference(1, 0);
    assert_eq!(c.parent.fence_reference_count(0, 0), None);
    assert_eq!(c.h.fences.release_count(fence), 1);
    assert!(!c.h.fences.is_live(fence));
    assert!(c.parent.output_fence(0, 0).is_none());
    assert!(c.parent.output_fence(1, 0).is_none());
}

#[test]
fn test_children_release_group_fence_on_completion() {
    let c = composite();
    for node in [&c.parent, &c.left, &c.right] {
        node.setup_request(0).unwrap();
    }
    let fence = c.parent.output_fence(0, 0).unwrap();
    assert_eq!(c.left.input_fences(0), vec![fence]);
    assert_eq!(c.right.input_fences(0), vec![fence]);

    c.parent.process_request(0, 0).unwrap();
    c.left.process_request(0, 0).unwrap();
    assert_eq!(c.parent.fence_reference_count(0, 0), Some(1));
    c.right.process_request(0, 0).unwrap();

    assert_eq!(c.h.fences.release_count(fence), 1);
    assert_eq!(c.h.fences.live_fences(), 0);
    assert_eq!(c.h.host.ledger().total(HostEvent::RequestIdDone, 0), 3);
}

#[test]
fn test_failed_group_fence_reaches_every_member() {
    let c = composite();
    c.parent.setup_request(0).unwrap();
    let fence = c.parent.output_fence(0, 0).unwrap();

    c.h.fences.signal(fence, FenceResult::Failed).unwrap();

    let ledger = c.h.host.ledger();
    assert_eq!(ledger.count(HostEvent::NonSinkError, c.parent.id(), 0), 2);
    assert_eq!(c.parent.fence_errors().len(), 2);
    assert!(c.parent.is_request_complete(0));
    assert_eq!(c.parent.fence_reference_count(0, 0), Some(2));
}

fn grouped_sink(id: u32, stream_id: u32, group: u32) -> OutputPortConfig {
    OutputPortConfig {
        id,
        format: Format::Nv12,
        width: common::builders::WIDTH,
        height: common::builders::HEIGHT,
        max_image_buffers: 4,
        sink: true,
        stream_id: Some(stream_id),
        composite_group: group,
        ..OutputPortConfig::default()
    }
}

#[test]
fn test_sink_group_behind_plain_output_settles_once() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("jpeg")
        .sink(0, 0)
        .output_with(grouped_sink(1, 1, 2))
        .output_with(grouped_sink(2, 2, 2))
        .build();
    let node = h.node(&config);
    h.finalize(&[&node]);
    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();

    let fence = node.output_fence(1, 0).unwrap();
    assert_eq!(node.output_fence(2, 0), Some(fence));
    assert_ne!(node.output_fence(0, 0), Some(fence));
    // Sinks hold no reference of their own
    assert_eq!(node.fence_reference_count(2, 0), Some(0));

    node.process_request(0, 0).unwrap();
    assert!(node.is_request_complete(0));
    assert_eq!(node.fence_reference_count(2, 0), None);
    assert_eq!(h.fences.release_count(fence), 1);
    assert_eq!(h.fences.live_fences(), 0);
    assert_eq!(h.host.ledger().total(HostEvent::SinkSignaled, 0), 3);
}
