//! Pixel formats and buffer property descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layout of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// 8-bit luma followed by interleaved chroma at quarter resolution
    #[default]
    Nv12,
    /// 10-bit variant of NV12 stored in 16-bit words
    P010,
    /// Packed 10-bit Bayer
    Raw10,
    /// Unpacked Bayer, one 16-bit word per pixel
    RawPlain16,
    /// Single 8-bit plane
    Y8,
    /// Compressed stream; size is a worst-case estimate
    Jpeg,
    /// Opaque bytes; width is the byte count, height is 1
    Blob,
}

impl Format {
    /// Average bits per pixel across all planes
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Format::Nv12 => 12,
            Format::P010 => 24,
            Format::Raw10 => 10,
            Format::RawPlain16 => 16,
            Format::Y8 => 8,
            Format::Jpeg => 12,
            Format::Blob => 8,
        }
    }

    /// Number of memory planes
    pub fn plane_count(self) -> u32 {
        match self {
            Format::Nv12 | Format::P010 => 2,
            _ => 1,
        }
    }

    pub fn is_raw(self) -> bool {
        matches!(self, Format::Raw10 | Format::RawPlain16)
    }

    /// Bytes needed for a `width` x `height` image in this format
    pub fn buffer_size(self, width: u32, height: u32) -> usize {
        let bits = width as u64 * height as u64 * self.bits_per_pixel() as u64;
        bits.div_ceil(8) as usize
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Nv12 => "NV12",
            Format::P010 => "P010",
            Format::Raw10 => "RAW10",
            Format::RawPlain16 => "RAWPLAIN16",
            Format::Y8 => "Y8",
            Format::Jpeg => "JPEG",
            Format::Blob => "BLOB",
        };
        f.write_str(name)
    }
}

/// Format plus dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ImageFormat {
    pub format: Format,
    pub width: u32,
    pub height: u32,
}

impl ImageFormat {
    pub const fn new(format: Format, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.format.buffer_size(self.width, self.height)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

/// Where buffer memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferHeap {
    /// Plain system memory
    #[default]
    System,
    /// Memory mapped into one or more devices
    Device,
}

/// Final properties of an output port after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferProperties {
    pub image_format: ImageFormat,
    pub heap: BufferHeap,
    /// Upper bound of buffers the port may have outstanding
    pub max_image_buffers: u32,
    /// Buffers allocated as soon as the manager is activated
    pub immediate_alloc_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_nv12() {
        // 1920 * 1080 * 1.5
        assert_eq!(Format::Nv12.buffer_size(1920, 1080), 3_110_400);
    }

    #[test]
    fn test_buffer_size_rounds_up() {
        // 3 pixels of 10 bits = 30 bits -> 4 bytes
        assert_eq!(Format::Raw10.buffer_size(3, 1), 4);
    }

    #[test]
    fn test_format_serde_names() {
        let json = serde_json::to_string(&Format::RawPlain16).unwrap();
        assert_eq!(json, "\"raw_plain16\"");
    }

    #[test]
    fn test_display() {
        let fmt = ImageFormat::new(Format::P010, 640, 480);
        assert_eq!(fmt.to_string(), "640x480 P010");
    }
}
