//! Vertex input descriptions.
//!
//! A [`VertexLayout`] tells a pipeline how to read one interleaved vertex
//! stream: the stride between vertices and where each attribute sits.

use crate::error::{RhiError, RhiResult};

/// Format of one vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexAttributeFormat {
    Float32x2,
    Float32x3,
    Float32x4,
    /// Three normalized bytes, read as a vec3 in `[0, 1]`.
    Unorm8x3,
    Unorm8x4,
}

impl VertexAttributeFormat {
    /// Size of the attribute in bytes.
    pub fn size(self) -> u32 {
        match self {
            VertexAttributeFormat::Float32x2 => 8,
            VertexAttributeFormat::Float32x3 => 12,
            VertexAttributeFormat::Float32x4 => 16,
            VertexAttributeFormat::Unorm8x3 => 3,
            VertexAttributeFormat::Unorm8x4 => 4,
        }
    }
}

/// One attribute at a shader location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexAttributeFormat,
    pub offset: u32,
}

/// Layout of a single interleaved vertex buffer at binding 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute.
    pub fn attribute(mut self, location: u32, format: VertexAttributeFormat, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }

    /// Checks that every attribute fits inside the stride and locations are unique.
    pub fn validate(&self) -> RhiResult<()> {
        for (i, attr) in self.attributes.iter().enumerate() {
            if attr.offset + attr.format.size() > self.stride {
                return Err(RhiError::PipelineError(format!(
                    "Vertex attribute at location {} ends at byte {}, past stride {}",
                    attr.location,
                    attr.offset + attr.format.size(),
                    self.stride
                )));
            }
            if self.attributes[..i]
                .iter()
                .any(|other| other.location == attr.location)
            {
                return Err(RhiError::PipelineError(format!(
                    "Duplicate vertex attribute location {}",
                    attr.location
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_sizes() {
        assert_eq!(VertexAttributeFormat::Float32x2.size(), 8);
        assert_eq!(VertexAttributeFormat::Float32x3.size(), 12);
        assert_eq!(VertexAttributeFormat::Unorm8x3.size(), 3);
    }

    #[test]
    fn test_layout_validate() {
        let layout = VertexLayout::new(28)
            .attribute(0, VertexAttributeFormat::Float32x3, 0)
            .attribute(1, VertexAttributeFormat::Unorm8x3, 12)
            .attribute(2, VertexAttributeFormat::Unorm8x3, 15)
            .attribute(3, VertexAttributeFormat::Float32x2, 20);
        assert!(layout.validate().is_ok());

        let overflow = VertexLayout::new(16).attribute(0, VertexAttributeFormat::Float32x3, 8);
        assert!(overflow.validate().is_err());

        let duplicate = VertexLayout::new(24)
            .attribute(0, VertexAttributeFormat::Float32x3, 0)
            .attribute(0, VertexAttributeFormat::Float32x3, 12);
        assert!(duplicate.validate().is_err());
    }
}
