//! Buffer requirement negotiation between linked nodes

mod common;

use camnode::buffer::{Format, ImageFormat};
use camnode::config::OutputPortConfig;
use camnode::fence::{FenceProvider, FenceResult};
use camnode::pipeline::negotiation::{default_finalize, BufferNegotiationData};
use camnode::pipeline::plugin::{ExecuteProcessRequestData, NodeCapabilities, NodeInitContext};
use camnode::pipeline::{BufferRequirement, HostEvent, Node, NodePlugin};
use camnode::{NodeError, Result};
use common::builders::{NodeConfigBuilder, HEIGHT, WIDTH};
use common::{capture_request, Harness};
use std::sync::Arc;

/// Accepts any input between a quarter and twice the output size,
/// preferring `optimal`
struct Scaler {
    optimal: (u32, u32),
}

impl NodePlugin for Scaler {
    fn initialize(&self, _ctx: &NodeInitContext) -> Result<NodeCapabilities> {
        Ok(NodeCapabilities::default())
    }

    fn execute_process_request(&self, node: &Node, data: &ExecuteProcessRequestData) -> Result<()> {
        node.signal_output_fences(data.request_id, FenceResult::Success)
    }

    fn finalize_input_requirement(&self, data: &mut BufferNegotiationData) -> Result<()> {
        default_finalize(data)?;
        for input in &mut data.inputs {
            input.requirement = Some(BufferRequirement::new(
                input.format,
                (WIDTH / 4, HEIGHT / 4),
                self.optimal,
                (WIDTH * 2, HEIGHT * 2),
            ));
        }
        Ok(())
    }
}

fn sensor(width: u32, height: u32) -> NodeConfigBuilder {
    NodeConfigBuilder::new("sensor").output_with(OutputPortConfig {
        id: 0,
        format: Format::Nv12,
        width,
        height,
        ..OutputPortConfig::default()
    })
}

#[test]
fn test_ranged_consumer_sets_parent_buffer_size() {
    let h = Harness::new();
    let parent = h.node(&sensor(1920, 1440).build());
    let child_config = NodeConfigBuilder::new("scaler")
        .input(0, "sensor", 0)
        .sink(1, 0)
        .build();
    let child = h
        .node_with(&child_config, Arc::new(Scaler { optimal: (1280, 960) }))
        .unwrap();
    h.link(&child, 0, &parent, 0);
    h.finalize(&[&parent, &child]);

    let requirement = parent.output_requirement(0).unwrap();
    assert!(requirement.is_valid());
    assert_eq!((requirement.min_width, requirement.min_height), (WIDTH / 4, HEIGHT / 4));
    assert_eq!((requirement.max_width, requirement.max_height), (1280, 960));
    assert_eq!(
        parent.output_image_format(0),
        Some(ImageFormat::new(Format::Nv12, 1280, 960))
    );
    // Sinks keep the stream size
    assert_eq!(
        child.output_image_format(0),
        Some(ImageFormat::new(Format::Nv12, WIDTH, HEIGHT))
    );
}

#[test]
fn test_optimal_clamped_to_port_capability() {
    let h = Harness::new();
    let parent = h.node(&sensor(800, 600).build());
    let child_config = NodeConfigBuilder::new("scaler")
        .input(0, "sensor", 0)
        .sink(1, 0)
        .build();
    let child = h
        .node_with(&child_config, Arc::new(Scaler { optimal: (1280, 960) }))
        .unwrap();
    h.link(&child, 0, &parent, 0);
    h.finalize(&[&parent, &child]);

    assert_eq!(
        parent.output_image_format(0),
        Some(ImageFormat::new(Format::Nv12, 800, 600))
    );
}

#[test]
fn test_consumers_of_one_output_are_intersected() {
    let h = Harness::new();
    let parent_config = sensor(1920, 1440).build();
    let left_config = NodeConfigBuilder::new("left")
        .input(0, "sensor", 0)
        .sink(1, 0)
        .build();
    let right_config = NodeConfigBuilder::new("right")
        .input(0, "sensor", 0)
        .sink(2, 1)
        .build();
    let parent = h.node(&parent_config);
    let left = h.node(&left_config);
    let right = h
        .node_with(&right_config, Arc::new(Scaler { optimal: (1280, 960) }))
        .unwrap();
    h.link(&left, 0, &parent, 0);
    h.link(&right, 0, &parent, 0);

    // The gate only opens once both consumers reported
    right.trigger_buffer_negotiation().unwrap();
    assert!(!parent.is_negotiation_complete());
    left.trigger_buffer_negotiation().unwrap();
    assert!(parent.is_negotiation_complete());
    parent.trigger_buffer_negotiation().unwrap();

    // Fixed 640x480 from the left wins inside the right's range
    let requirement = parent.output_requirement(0).unwrap();
    assert_eq!((requirement.min_width, requirement.max_width), (WIDTH, WIDTH));
    assert_eq!((requirement.optimal_width, requirement.optimal_height), (WIDTH, HEIGHT));
}

#[test]
fn test_unsatisfiable_consumer_fails_negotiation() {
    let h = Harness::new();
    let parent = h.node(&sensor(320, 240).build());
    let child_config = NodeConfigBuilder::new("ife")
        .input(0, "sensor", 0)
        .sink(1, 0)
        .build();
    let child = h.node(&child_config);
    h.link(&child, 0, &parent, 0);

    let err = child.trigger_buffer_negotiation().unwrap_err();
    assert!(matches!(err.root(), NodeError::InvalidState(_)), "{}", err);
    assert!(!parent.is_negotiation_complete());
}

#[test]
fn test_source_port_outside_requirement_rejected() {
    let h = Harness::new();
    let mut config = NodeConfigBuilder::new("ipe").source(0).sink(1, 0).build();
    config.inputs[0].width = 1920;
    config.inputs[0].height = 1080;
    let node = h.node(&config);

    node.trigger_buffer_negotiation().unwrap();
    let err = node.check_source_port_buffer_requirements().unwrap_err();
    assert!(matches!(err.root(), NodeError::InvalidArg(_)), "{}", err);
}

#[test]
fn test_source_port_imports_client_buffer() {
    let h = Harness::new();
    let config = NodeConfigBuilder::new("ipe").source(0).sink(1, 0).build();
    let node = h.node(&config);
    h.finalize(&[&node]);
    node.check_source_port_buffer_requirements().unwrap();

    h.submit(capture_request(&[config], 0));
    node.setup_request(0).unwrap();
    let inputs = node.input_fences(0);
    assert_eq!(inputs.len(), 1);
    // No acquire fence from the client, so a signalled private one stands in
    assert_eq!(h.fences.result(inputs[0]), Some(FenceResult::Success));

    node.process_request(0, 0).unwrap();
    assert!(node.is_request_complete(0));
    assert_eq!(h.host.ledger().total(HostEvent::SourceReleased, 0), 1);
    assert_eq!(h.fences.release_count(inputs[0]), 1);
    assert_eq!(h.fences.live_fences(), 0);
}

#[test]
fn test_lag_beyond_parent_buffers_rejected() {
    let h = Harness::new();
    let mut parent_config = sensor(WIDTH, HEIGHT).build();
    parent_config.outputs[0].max_image_buffers = 2;
    let child_config = NodeConfigBuilder::new("tnr")
        .lagged_input(0, "sensor", 0, 2)
        .sink(1, 0)
        .build();
    let parent = h.node(&parent_config);
    let child = h.node(&child_config);
    h.link(&child, 0, &parent, 0);
    child.trigger_buffer_negotiation().unwrap();
    parent.trigger_buffer_negotiation().unwrap();

    parent.finalize_buffer_properties().unwrap();
    let err = child.finalize_buffer_properties().unwrap_err();
    assert!(matches!(err.root(), NodeError::InvalidArg(_)), "{}", err);
}

#[test]
fn test_fence_provider_is_object_safe() {
    let h = Harness::new();
    let provider: Arc<dyn FenceProvider> = h.fences.clone();
    let fence = provider.create_private_fence("scratch").unwrap();
    provider.signal(fence, FenceResult::Success).unwrap();
    provider.release(fence).unwrap();
    assert_eq!(h.fences.release_count(fence), 1);
}
