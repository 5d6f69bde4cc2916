//! Dynamic-offset uniform packing.
//!
//! Camera and scene data for every frame slot live in one uniform buffer.
//! Each struct starts at an offset that is a multiple of the device's
//! `min_uniform_buffer_offset_alignment`, so the same descriptor can address
//! any of them through a dynamic offset:
//!
//! ```text
//! | slot 0: camera | pad | scene | pad | slot 1: camera | pad | scene | pad |
//! 0                      stride                                      2 * stride
//! ```

use bytemuck::Pod;

use renderer_rhi::DeviceLimits;

/// Rounds `size` up to a multiple of `alignment`. An alignment of 0 leaves it unchanged.
#[inline]
pub fn pad_uniform_size(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        size
    } else {
        size.div_ceil(alignment) * alignment
    }
}

/// One registered struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformRegion {
    pub name: &'static str,
    /// Unpadded size, used as the descriptor range.
    pub size: u64,
    /// Size rounded up to the alignment.
    pub padded_size: u64,
    /// Offset inside one frame slot's region.
    pub offset: u64,
}

/// Index of a struct registered with a [`UniformLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformSlot(usize);

/// Running layout of the structs packed into each frame slot's region.
#[derive(Clone, Debug)]
pub struct UniformLayout {
    alignment: u64,
    regions: Vec<UniformRegion>,
    stride: u64,
}

impl UniformLayout {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment,
            regions: Vec::new(),
            stride: 0,
        }
    }

    /// Uses the backend's uniform offset alignment.
    pub fn from_limits(limits: &DeviceLimits) -> Self {
        Self::new(limits.min_uniform_buffer_offset_alignment)
    }

    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Rounds `size` up to this layout's alignment.
    #[inline]
    pub fn pad_size(&self, size: u64) -> u64 {
        pad_uniform_size(size, self.alignment)
    }

    /// Appends a struct of `size` bytes after everything registered so far.
    pub fn register(&mut self, name: &'static str, size: u64) -> UniformSlot {
        let padded_size = self.pad_size(size);
        self.regions.push(UniformRegion {
            name,
            size,
            padded_size,
            offset: self.stride,
        });
        self.stride += padded_size;
        UniformSlot(self.regions.len() - 1)
    }

    /// Registers `T` by its size.
    pub fn register_type<T: Pod>(&mut self, name: &'static str) -> UniformSlot {
        self.register(name, size_of::<T>() as u64)
    }

    pub fn region(&self, slot: UniformSlot) -> Option<&UniformRegion> {
        self.regions.get(slot.0)
    }

    /// Offset of `slot` inside one frame's region.
    pub fn offset_of(&self, slot: UniformSlot) -> Option<u64> {
        self.region(slot).map(|r| r.offset)
    }

    /// Bytes one frame slot occupies.
    #[inline]
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Start of frame slot `frame`'s region.
    #[inline]
    pub fn frame_offset(&self, frame: usize) -> u64 {
        frame as u64 * self.stride
    }

    /// Dynamic offset of `slot` for frame slot `frame`.
    pub fn dynamic_offset(&self, frame: usize, slot: UniformSlot) -> Option<u32> {
        let offset = self.frame_offset(frame) + self.offset_of(slot)?;
        u32::try_from(offset).ok()
    }

    /// Size of a buffer holding `frames` frame regions.
    #[inline]
    pub fn buffer_size(&self, frames: usize) -> u64 {
        self.frame_offset(frames)
    }

    pub fn regions(&self) -> &[UniformRegion] {
        &self.regions
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_uniform_size() {
        assert_eq!(pad_uniform_size(16, 256), 256);
        assert_eq!(pad_uniform_size(256, 256), 256);
        assert_eq!(pad_uniform_size(257, 256), 512);
        assert_eq!(pad_uniform_size(80, 64), 128);
        assert_eq!(pad_uniform_size(0, 256), 0);
        assert_eq!(pad_uniform_size(80, 0), 80);
    }

    #[test]
    fn test_two_structs_at_256() {
        let mut layout = UniformLayout::new(256);
        let camera = layout.register("camera", 16);
        let scene = layout.register("scene", 80);

        let padded: Vec<u64> = layout.regions().iter().map(|r| r.padded_size).collect();
        assert_eq!(padded, vec![256, 256]);
        assert_eq!(layout.offset_of(camera), Some(0));
        assert_eq!(layout.offset_of(scene), Some(256));
        assert_eq!(layout.stride(), 512);
        assert_eq!(layout.frame_offset(1), 512);
        assert_eq!(layout.dynamic_offset(1, scene), Some(768));
        assert_eq!(layout.buffer_size(2), 1024);
    }

    #[test]
    fn test_offsets_are_aligned() {
        let mut layout = UniformLayout::new(64);
        let slots: Vec<UniformSlot> = [1, 65, 128, 3]
            .iter()
            .map(|&size| layout.register("s", size))
            .collect();
        for frame in 0..3 {
            for &slot in &slots {
                let offset = layout.dynamic_offset(frame, slot).unwrap();
                assert_eq!(offset % 64, 0);
            }
        }
        // Regions never overlap
        for pair in layout.regions().windows(2) {
            assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }
    }

    #[test]
    fn test_from_limits() {
        let layout = UniformLayout::from_limits(&DeviceLimits::default());
        assert_eq!(layout.alignment(), 256);
        assert!(layout.is_empty());
    }

    #[test]
    fn test_unknown_slot() {
        let mut other = UniformLayout::new(256);
        other.register("a", 4);
        let slot = other.register("b", 4);
        let layout = UniformLayout::new(256);
        assert_eq!(layout.offset_of(slot), None);
    }
}
