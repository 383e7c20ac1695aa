//! Mock construction helpers

use camnode::backend::{DeviceChannel, DevicePacket};
use camnode::pipeline::plugin::{ExecuteProcessRequestData, NodeCapabilities, NodeInitContext, NodePlugin};
use camnode::pipeline::Node;
use camnode::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use mockall::mock;

mock! {
    pub Plugin {}

    impl NodePlugin for Plugin {
        fn initialize(&self, ctx: &NodeInitContext) -> Result<NodeCapabilities>;
        fn execute_process_request(&self, node: &Node, data: &ExecuteProcessRequestData) -> Result<()>;
        fn cancel_request(&self, request_id: u64);
    }
}

mock! {
    pub Device {}

    impl DeviceChannel for Device {
        fn submit(&self, packet: DevicePacket) -> Result<()>;
        fn cancel(&self, request_id: u64);
    }
}

/// Plugin that initializes with default capabilities and accepts any
/// number of execute and cancel calls without signalling anything
pub fn idle_plugin() -> MockPlugin {
    let mut plugin = MockPlugin::new();
    plugin
        .expect_initialize()
        .returning(|_| Ok(NodeCapabilities::default()));
    plugin
        .expect_execute_process_request()
        .returning(|_, _| Ok(()));
    plugin.expect_cancel_request().return_const(());
    plugin
}

/// Device that forwards every packet to a channel instead of signalling
pub fn recording_device() -> (MockDevice, Receiver<DevicePacket>) {
    let (tx, rx): (Sender<DevicePacket>, Receiver<DevicePacket>) = unbounded();
    let mut device = MockDevice::new();
    device.expect_submit().returning(move |packet| {
        let _ = tx.send(packet);
        Ok(())
    });
    device.expect_cancel().return_const(());
    (device, rx)
}
