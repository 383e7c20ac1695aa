//! Test data builders for creating test objects

use camnode::buffer::Format;
use camnode::config::{InputPortConfig, NodeConfig, NodeKind, OutputPortConfig};

/// Size used for every port built here
pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

/// Builder for creating test node configs
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: NodeConfig {
                name: name.to_string(),
                ..NodeConfig::default()
            },
        }
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn bypassable(mut self) -> Self {
        self.config.bypassable = true;
        self
    }

    pub fn inplace(mut self) -> Self {
        self.config.inplace = true;
        self
    }

    pub fn realtime(mut self) -> Self {
        self.config.realtime = true;
        self
    }

    pub fn deferred_init(mut self) -> Self {
        self.config.deferred_init = true;
        self
    }

    pub fn publish_tag(mut self, tag: u32) -> Self {
        self.config.publish_tags.push(tag);
        self
    }

    /// Intra-pipeline output
    pub fn output(self, id: u32) -> Self {
        self.output_with(OutputPortConfig {
            id,
            ..port()
        })
    }

    /// Client stream output
    pub fn sink(self, id: u32, stream_id: u32) -> Self {
        self.output_with(OutputPortConfig {
            id,
            sink: true,
            stream_id: Some(stream_id),
            ..port()
        })
    }

    /// Output sharing a fence with the other members of `group`
    pub fn composite_output(self, id: u32, group: u32) -> Self {
        self.output_with(OutputPortConfig {
            id,
            composite_group: group,
            ..port()
        })
    }

    pub fn output_with(mut self, port: OutputPortConfig) -> Self {
        self.config.outputs.push(port);
        self
    }

    /// Input fed by `parent_port` of `parent`
    pub fn input(self, id: u32, parent: &str, parent_port: u32) -> Self {
        self.input_with(InputPortConfig {
            id,
            parent: Some(parent.to_string()),
            parent_port,
            ..input_port()
        })
    }

    /// Input reading `delta` requests behind its parent
    pub fn lagged_input(self, id: u32, parent: &str, parent_port: u32, delta: u32) -> Self {
        self.input_with(InputPortConfig {
            id,
            parent: Some(parent.to_string()),
            parent_port,
            buffer_delta: delta,
            ..input_port()
        })
    }

    /// Input fed by a client buffer
    pub fn source(self, id: u32) -> Self {
        self.input_with(InputPortConfig {
            id,
            ..input_port()
        })
    }

    pub fn input_with(mut self, port: InputPortConfig) -> Self {
        self.config.inputs.push(port);
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

fn port() -> OutputPortConfig {
    OutputPortConfig {
        format: Format::Nv12,
        width: WIDTH,
        height: HEIGHT,
        ..OutputPortConfig::default()
    }
}

fn input_port() -> InputPortConfig {
    InputPortConfig {
        format: Format::Nv12,
        width: WIDTH,
        height: HEIGHT,
        ..InputPortConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_builder() {
        let config = NodeConfigBuilder::new("ife")
            .kind(NodeKind::Hardware)
            .input(0, "sensor", 3)
            .sink(1, 0)
            .build();

        assert_eq!(config.name, "ife");
        assert_eq!(config.kind, NodeKind::Hardware);
        assert_eq!(config.inputs[0].parent.as_deref(), Some("sensor"));
        assert_eq!(config.outputs[0].stream_id, Some(0));
        assert_eq!(config.outputs[0].width, WIDTH);
    }
}
