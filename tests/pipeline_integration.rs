//! End-to-end runs through pipelines built from TOML descriptions

mod common;

use camnode::config::PipelineConfig;
use camnode::pipeline::{HostEvent, PipelineBuilder, PipelineError, PipelineEvent};
use camnode::NodeError;
use common::mock_helpers::idle_plugin;
use common::test_timeout;
use std::sync::Arc;

const SOFTWARE_CHAIN: &str = r#"
name = "software_chain"

[settings]
max_request_queue_depth = 8
job_pool_threads = 2
image_buffer_wait_time_ms = 20

[[nodes]]
name = "sensor"
kind = "software"

[[nodes.outputs]]
id = 10
format = "nv12"
width = 640
height = 480
max_image_buffers = 8

[[nodes]]
name = "isp"
kind = "software"

[[nodes.inputs]]
id = 0
parent = "sensor"
parent_port = 10
format = "nv12"

[[nodes.outputs]]
id = 0
sink = true
stream_id = 0
format = "nv12"
width = 640
height = 480
max_image_buffers = 8
"#;

fn software_chain() -> PipelineConfig {
    PipelineConfig::from_toml_str(SOFTWARE_CHAIN).unwrap()
}

fn sim_config() -> PipelineConfig {
    PipelineConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/configs/sim.toml")).unwrap()
}

#[test]
fn test_software_chain_completes_more_requests_than_slots() {
    let config = software_chain();
    let pipeline = PipelineBuilder::new(config.clone()).build().unwrap();
    assert!(pipeline.is_finalized());
    assert_eq!(pipeline.execution_order(), &[0, 1]);

    for request_id in 0..12 {
        pipeline.submit_request(config.capture_request(request_id)).unwrap();
    }
    assert!(pipeline.wait_idle(test_timeout()));

    for request_id in 0..12 {
        let outcome = pipeline.wait_request(request_id, test_timeout()).unwrap();
        assert!(!outcome.failed, "request {} failed", request_id);
        assert_eq!(pipeline.ledger().total(HostEvent::RequestIdDone, request_id), 2);
        assert_eq!(pipeline.ledger().total(HostEvent::SinkSignaled, request_id), 1);
    }
    assert!(pipeline.in_flight_requests().is_empty());
    assert_eq!(pipeline.fences().live_fences(), 0);
}

#[test]
fn test_sim_config_runs_on_device() {
    let config = sim_config();
    let pipeline = PipelineBuilder::new(config.clone()).build().unwrap();
    assert!(pipeline.device().is_some());
    let events = pipeline.events();

    for request_id in 0..4 {
        pipeline.submit_request(config.capture_request(request_id)).unwrap();
    }
    assert!(pipeline.wait_idle(test_timeout()));

    let completed: Vec<(u64, bool)> = events
        .try_iter()
        .filter_map(|e| match e {
            PipelineEvent::RequestCompleted { request_id, failed } => Some((request_id, failed)),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 4);
    assert!(completed.iter().all(|(_, failed)| !failed));
}

#[test]
fn test_device_failure_marks_only_that_request() {
    let mut config = sim_config();
    config.device.failing_requests = vec![1];
    let pipeline = PipelineBuilder::new(config.clone()).build().unwrap();

    for request_id in 0..3 {
        pipeline.submit_request(config.capture_request(request_id)).unwrap();
    }
    assert!(pipeline.wait_idle(test_timeout()));

    assert!(!pipeline.wait_request(0, test_timeout()).unwrap().failed);
    assert!(pipeline.wait_request(1, test_timeout()).unwrap().failed);
    assert!(!pipeline.wait_request(2, test_timeout()).unwrap().failed);
}

#[test]
fn test_flush_request_fails_stuck_request() {
    let config = software_chain();
    let pipeline = PipelineBuilder::new(config.clone())
        .with_plugin("isp", Arc::new(idle_plugin()))
        .build()
        .unwrap();

    pipeline.submit_request(config.capture_request(0)).unwrap();
    assert!(matches!(
        pipeline.wait_request(0, std::time::Duration::from_millis(50)),
        Err(PipelineError::Timeout(0))
    ));

    pipeline.flush_request(0).unwrap();
    let outcome = pipeline.wait_request(0, test_timeout()).unwrap();
    assert!(outcome.failed);
    assert_eq!(pipeline.dump().last_flushed_request_id, Some(0));

    // Already settled
    pipeline.flush_request(0).unwrap();
    assert!(matches!(
        pipeline.flush_request(99),
        Err(PipelineError::UnknownRequest(99))
    ));
    assert!(pipeline.wait_idle(test_timeout()));
}

#[test]
fn test_duplicate_submit_rejected() {
    let config = software_chain();
    let pipeline = PipelineBuilder::new(config.clone())
        .with_plugin("isp", Arc::new(idle_plugin()))
        .build()
        .unwrap();

    pipeline.submit_request(config.capture_request(0)).unwrap();
    let err = pipeline.submit_request(config.capture_request(0)).unwrap_err();
    assert!(matches!(err, PipelineError::Config(NodeError::InvalidArg(_))), "{}", err);

    pipeline.flush_all().unwrap();
    assert!(pipeline.wait_idle(test_timeout()));
}

#[test]
fn test_plugin_for_unknown_node_rejected() {
    let err = PipelineBuilder::new(software_chain())
        .with_plugin("jpeg", Arc::new(idle_plugin()))
        .build()
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownNode(ref name) if name == "jpeg"));
}

#[test]
fn test_destroyed_pipeline_rejects_requests() {
    let config = software_chain();
    let pipeline = PipelineBuilder::new(config.clone()).build().unwrap();
    pipeline.destroy();
    pipeline.destroy();

    assert!(!pipeline.is_finalized());
    assert!(matches!(
        pipeline.submit_request(config.capture_request(0)),
        Err(PipelineError::NotFinalized)
    ));
    assert!(pipeline.nodes().iter().all(|n| n.is_destroyed()));
}

#[test]
fn test_dump_json_lists_every_node() {
    let config = software_chain();
    let pipeline = PipelineBuilder::new(config.clone()).build().unwrap();
    pipeline.submit_request(config.capture_request(0)).unwrap();
    assert!(pipeline.wait_idle(test_timeout()));

    let json: serde_json::Value = serde_json::from_str(&pipeline.dump_json().unwrap()).unwrap();
    assert_eq!(json["name"], "software_chain");
    assert_eq!(json["nodes"].as_array().map(|n| n.len()), Some(2));
    assert_eq!(json["live_fences"], 0);
}

#[test]
fn test_config_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.toml");
    let config = software_chain();
    config.save(&path).unwrap();

    let loaded = PipelineConfig::load(&path).unwrap();
    assert_eq!(loaded.name, config.name);
    assert_eq!(loaded.nodes.len(), 2);
    assert_eq!(loaded.node("isp").map(|n| n.inputs.len()), Some(1));
}
