//! Buffer requirement data exchanged during negotiation.
//!
//! Requirements flow from sinks towards sources. Each output port collects
//! one [`BufferRequirement`] per connected input; once every output of a node
//! has heard from all of its consumers the node computes what it needs on its
//! own inputs and forwards that to its parents.
//!
//! [`default_finalize`] is the stock computation used when a node plugin does
//! not supply its own.

use crate::buffer::format::{Format, ImageFormat};
use crate::error::{NodeError, Result};
use serde::Serialize;

/// Acceptable dimension range for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferRequirement {
    pub format: Format,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub optimal_width: u32,
    pub optimal_height: u32,
}

impl BufferRequirement {
    /// A requirement that accepts exactly one size
    pub fn fixed(image: ImageFormat) -> Self {
        Self {
            format: image.format,
            min_width: image.width,
            min_height: image.height,
            max_width: image.width,
            max_height: image.height,
            optimal_width: image.width,
            optimal_height: image.height,
        }
    }

    pub fn new(format: Format, min: (u32, u32), optimal: (u32, u32), max: (u32, u32)) -> Self {
        Self {
            format,
            min_width: min.0,
            min_height: min.1,
            max_width: max.0,
            max_height: max.1,
            optimal_width: optimal.0,
            optimal_height: optimal.1,
        }
    }

    /// `min <= optimal <= max` in both dimensions
    pub fn is_valid(&self) -> bool {
        self.min_width <= self.optimal_width
            && self.optimal_width <= self.max_width
            && self.min_height <= self.optimal_height
            && self.optimal_height <= self.max_height
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(NodeError::InvalidState(format!(
                "requirement out of order: min {}x{} optimal {}x{} max {}x{}",
                self.min_width,
                self.min_height,
                self.optimal_width,
                self.optimal_height,
                self.max_width,
                self.max_height
            )))
        }
    }

    /// Whether a `width` x `height` buffer satisfies the range
    pub fn contains(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }

    pub fn optimal(&self) -> ImageFormat {
        ImageFormat::new(self.format, self.optimal_width, self.optimal_height)
    }

    /// Restrict the range to what a port can produce
    pub fn clamp_to(&self, capability: ImageFormat) -> Result<Self> {
        let mut clamped = *self;
        clamped.max_width = clamped.max_width.min(capability.width);
        clamped.max_height = clamped.max_height.min(capability.height);
        if clamped.min_width > clamped.max_width || clamped.min_height > clamped.max_height {
            return Err(NodeError::InvalidState(format!(
                "consumers need at least {}x{} but the port produces at most {}",
                clamped.min_width, clamped.min_height, capability
            )));
        }
        clamped.optimal_width = clamped
            .optimal_width
            .clamp(clamped.min_width, clamped.max_width);
        clamped.optimal_height = clamped
            .optimal_height
            .clamp(clamped.min_height, clamped.max_height);
        Ok(clamped)
    }
}

/// Intersect the ranges requested by several consumers of one port.
pub fn merge_requirements(requirements: &[BufferRequirement]) -> Result<BufferRequirement> {
    let (first, rest) = requirements
        .split_first()
        .ok_or_else(|| NodeError::InvalidArg("no requirements to merge".to_string()))?;

    let mut merged = *first;
    for req in rest {
        if req.format != merged.format {
            return Err(NodeError::InvalidState(format!(
                "consumers disagree on format: {} vs {}",
                merged.format, req.format
            )));
        }
        merged.min_width = merged.min_width.max(req.min_width);
        merged.min_height = merged.min_height.max(req.min_height);
        merged.max_width = merged.max_width.min(req.max_width);
        merged.max_height = merged.max_height.min(req.max_height);
        merged.optimal_width = merged.optimal_width.max(req.optimal_width);
        merged.optimal_height = merged.optimal_height.max(req.optimal_height);
    }

    if merged.min_width > merged.max_width || merged.min_height > merged.max_height {
        return Err(NodeError::InvalidState(format!(
            "no common size: min {}x{} exceeds max {}x{}",
            merged.min_width, merged.min_height, merged.max_width, merged.max_height
        )));
    }
    merged.optimal_width = merged.optimal_width.clamp(merged.min_width, merged.max_width);
    merged.optimal_height = merged.optimal_height.clamp(merged.min_height, merged.max_height);
    Ok(merged)
}

/// Negotiation view of one output port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputPortNegotiationData {
    pub output_index: usize,
    pub port_id: u32,
    /// Largest image the port can produce; exact size for sink ports
    pub capability: ImageFormat,
    pub is_sink: bool,
    /// One entry per connected input that has reported
    pub input_requirements: Vec<BufferRequirement>,
    /// Set by finalization
    pub final_requirement: Option<BufferRequirement>,
}

/// Negotiation view of one input port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputPortNegotiationData {
    pub input_index: usize,
    pub port_id: u32,
    pub format: Format,
    /// Default size used when the node has no outputs to derive from
    pub default_size: (u32, u32),
    /// Set by finalization, forwarded to the parent
    pub requirement: Option<BufferRequirement>,
}

/// Everything a node sees when it finalizes its input requirements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferNegotiationData {
    pub node: String,
    pub outputs: Vec<OutputPortNegotiationData>,
    pub inputs: Vec<InputPortNegotiationData>,
}

/// Stock finalization.
///
/// Output ports take the intersection of their consumers' ranges clamped to
/// what the port can produce; sink ports and ports without consumers use
/// their configured size. Each input then asks for the largest output range.
pub fn default_finalize(data: &mut BufferNegotiationData) -> Result<()> {
    for output in &mut data.outputs {
        let requirement = if output.is_sink || output.input_requirements.is_empty() {
            BufferRequirement::fixed(output.capability)
        } else {
            let merged = merge_requirements(&output.input_requirements)?;
            if merged.format != output.capability.format {
                return Err(NodeError::InvalidState(format!(
                    "port {} of {} produces {} but consumers want {}",
                    output.port_id, data.node, output.capability.format, merged.format
                )));
            }
            merged.clamp_to(output.capability)?
        };
        requirement.validate()?;
        output.final_requirement = Some(requirement);
    }

    let finals: Vec<BufferRequirement> = data
        .outputs
        .iter()
        .filter_map(|o| o.final_requirement)
        .collect();

    for input in &mut data.inputs {
        let requirement = if finals.is_empty() {
            BufferRequirement::fixed(ImageFormat::new(
                input.format,
                input.default_size.0,
                input.default_size.1,
            ))
        } else {
            BufferRequirement {
                format: input.format,
                min_width: finals.iter().map(|r| r.min_width).max().unwrap_or(0),
                min_height: finals.iter().map(|r| r.min_height).max().unwrap_or(0),
                max_width: finals.iter().map(|r| r.max_width).max().unwrap_or(0),
                max_height: finals.iter().map(|r| r.max_height).max().unwrap_or(0),
                optimal_width: finals.iter().map(|r| r.optimal_width).max().unwrap_or(0),
                optimal_height: finals.iter().map(|r| r.optimal_height).max().unwrap_or(0),
            }
        };
        requirement.validate()?;
        input.requirement = Some(requirement);
    }
    Ok(())
}
