//! Texture packing and unpacking.
//!
//! Textures are stored as a sequence of pages, one per mip level from finest to
//! coarsest. Each page is compressed on its own, so a single mip can be decoded
//! without touching the others. Page offsets are not stored: the offset of page
//! `i` is the sum of the compressed sizes of pages `0..i`.

use std::fmt;
use std::path::Path;

use renderer_core::ScopedTimer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::{self, CompressionMode};
use crate::container::{AssetContainer, AssetType};
use crate::error::{AssetError, AssetResult};

/// Content version of texture containers.
pub const TEXTURE_CONTENT_VERSION: u16 = 1;

/// Pixel format of a texture payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    #[default]
    Unknown,
    /// 8 bits per channel RGBA.
    Rgba8,
}

impl TextureFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            TextureFormat::Unknown => "Unknown",
            TextureFormat::Rgba8 => "RGBA8",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "RGBA8" => TextureFormat::Rgba8,
            _ => TextureFormat::Unknown,
        }
    }

    pub fn bytes_per_pixel(self) -> Option<u64> {
        match self {
            TextureFormat::Unknown => None,
            TextureFormat::Rgba8 => Some(4),
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Width and height of one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageExtent {
    pub width: u32,
    pub height: u32,
}

impl PageExtent {
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Extent of the next coarser mip: half of each side, never below one.
    #[inline]
    pub fn next_mip(self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
        }
    }

    #[inline]
    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One page as described in the metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes this page occupies in the payload.
    pub compressed_size: u64,
    /// Bytes after decoding.
    pub original_size: u64,
}

impl PageInfo {
    #[inline]
    pub fn extent(&self) -> PageExtent {
        PageExtent::new(self.width, self.height)
    }

    /// Whether this page was stored without compression.
    #[inline]
    pub fn is_raw(&self) -> bool {
        self.compressed_size == self.original_size
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextureMetadata {
    format: String,
    compression: CompressionMode,
    buffer_size: u64,
    source_file: String,
    pages: Vec<PageInfo>,
}

/// Description of a packed texture, read from container metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureInfo {
    pub format: TextureFormat,
    pub compression: CompressionMode,
    /// Total decoded size of all pages.
    pub buffer_size: u64,
    pub source_file: String,
    pub pages: Vec<PageInfo>,
}

impl TextureInfo {
    /// Parses and validates texture metadata.
    ///
    /// # Errors
    ///
    /// Fails if the container is not a texture, has an unsupported content version,
    /// has no pages, breaks the mip halving rule, or declares sizes that do not add up.
    pub fn read(container: &AssetContainer) -> AssetResult<Self> {
        container.expect(AssetType::TEXTURE, TEXTURE_CONTENT_VERSION)?;
        let meta: TextureMetadata = serde_json::from_str(container.metadata())?;

        let info = Self {
            format: TextureFormat::parse(&meta.format),
            compression: meta.compression,
            buffer_size: meta.buffer_size,
            source_file: meta.source_file,
            pages: meta.pages,
        };

        if info.pages.is_empty() {
            return Err(AssetError::InvalidMetadata("texture has no pages".to_owned()));
        }
        let extents: Vec<PageExtent> = info.pages.iter().map(PageInfo::extent).collect();
        validate_mip_chain(&extents).map_err(|e| AssetError::InvalidMetadata(e.to_string()))?;

        let mut total = 0u64;
        let mut stored = 0u64;
        for (i, page) in info.pages.iter().enumerate() {
            if let Some(bpp) = info.format.bytes_per_pixel() {
                let expected = page.extent().pixel_count().checked_mul(bpp).ok_or_else(|| {
                    AssetError::Corrupt(format!("page {} size overflows", i))
                })?;
                if page.original_size != expected {
                    return Err(AssetError::InvalidMetadata(format!(
                        "page {} of {}x{} declares {} bytes, expected {}",
                        i, page.width, page.height, page.original_size, expected
                    )));
                }
            }
            compression::check_unit_size(
                info.page_mode(page),
                page.compressed_size,
                page.original_size,
            )?;
            total = total
                .checked_add(page.original_size)
                .ok_or_else(|| AssetError::Corrupt("texture size overflows".to_owned()))?;
            stored = stored
                .checked_add(page.compressed_size)
                .ok_or_else(|| AssetError::Corrupt("payload size overflows".to_owned()))?;
        }

        if total != info.buffer_size {
            return Err(AssetError::InvalidMetadata(format!(
                "pages add up to {} bytes but bufferSize is {}",
                total, info.buffer_size
            )));
        }
        if stored != container.payload().len() as u64 {
            return Err(AssetError::Corrupt(format!(
                "page table covers {} bytes but payload holds {}",
                stored,
                container.payload().len()
            )));
        }

        Ok(info)
    }

    /// Offset of a page inside the payload.
    pub fn page_offset(&self, page_index: usize) -> Option<u64> {
        if page_index >= self.pages.len() {
            return None;
        }
        Some(self.pages[..page_index].iter().map(|p| p.compressed_size).sum())
    }

    /// Offset of a page inside the decoded pixel buffer.
    pub fn page_output_offset(&self, page_index: usize) -> Option<u64> {
        if page_index >= self.pages.len() {
            return None;
        }
        Some(self.pages[..page_index].iter().map(|p| p.original_size).sum())
    }

    /// Payload size implied by the page table.
    pub fn payload_size(&self) -> u64 {
        self.pages.iter().map(|p| p.compressed_size).sum()
    }

    /// Size of the finest page.
    #[inline]
    pub fn extent(&self) -> PageExtent {
        self.pages
            .first()
            .map_or(PageExtent::new(0, 0), PageInfo::extent)
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_mode(&self, page: &PageInfo) -> CompressionMode {
        if self.compression == CompressionMode::None || page.is_raw() {
            CompressionMode::None
        } else {
            self.compression
        }
    }
}

/// Checks that every page is half the size of the previous one (minimum 1).
pub fn validate_mip_chain(extents: &[PageExtent]) -> AssetResult<()> {
    if let Some(first) = extents.first()
        && (first.width == 0 || first.height == 0)
    {
        return Err(AssetError::InvalidInput(format!(
            "page 0 has an empty extent {}x{}",
            first.width, first.height
        )));
    }

    for (i, pair) in extents.windows(2).enumerate() {
        let expected = pair[0].next_mip();
        if pair[1] != expected {
            return Err(AssetError::InvalidInput(format!(
                "page {} is {}x{}, expected {}x{}",
                i + 1,
                pair[1].width,
                pair[1].height,
                expected.width,
                expected.height
            )));
        }
    }
    Ok(())
}

/// Extents of a full mip chain down to 1x1.
pub fn mip_chain_extents(width: u32, height: u32) -> Vec<PageExtent> {
    let mut current = PageExtent::new(width.max(1), height.max(1));
    let mut extents = vec![current];
    while current.width > 1 || current.height > 1 {
        current = current.next_mip();
        extents.push(current);
    }
    extents
}

/// Builds a full RGBA8 mip chain with a 2x2 box filter.
///
/// Returns the page extents and the concatenated page bytes, ready for [`pack_texture`].
pub fn generate_mip_chain(
    width: u32,
    height: u32,
    rgba: &[u8],
) -> AssetResult<(Vec<PageExtent>, Vec<u8>)> {
    let expected = u64::from(width) * u64::from(height) * 4;
    if width == 0 || height == 0 || rgba.len() as u64 != expected {
        return Err(AssetError::InvalidInput(format!(
            "{}x{} RGBA8 image needs {} bytes, got {}",
            width,
            height,
            expected,
            rgba.len()
        )));
    }

    let extents = mip_chain_extents(width, height);
    let total: u64 = extents.iter().map(|e| e.pixel_count() * 4).sum();
    let mut pixels = Vec::with_capacity(total as usize);
    pixels.extend_from_slice(rgba);

    let mut src_start = 0;
    for pair in extents.windows(2) {
        let (src, dst) = (pair[0], pair[1]);
        let src_len = src.pixel_count() as usize * 4;
        let level = downsample(&pixels[src_start..src_start + src_len], src, dst);
        src_start += src_len;
        pixels.extend_from_slice(&level);
    }

    Ok((extents, pixels))
}

fn downsample(src: &[u8], src_extent: PageExtent, dst_extent: PageExtent) -> Vec<u8> {
    let (sw, sh) = (src_extent.width as usize, src_extent.height as usize);
    let (dw, dh) = (dst_extent.width as usize, dst_extent.height as usize);
    let mut out = Vec::with_capacity(dw * dh * 4);

    for y in 0..dh {
        for x in 0..dw {
            let xs = [(2 * x).min(sw - 1), (2 * x + 1).min(sw - 1)];
            let ys = [(2 * y).min(sh - 1), (2 * y + 1).min(sh - 1)];
            for c in 0..4 {
                let sum: u32 = ys
                    .iter()
                    .flat_map(|&sy| xs.iter().map(move |&sx| (sy * sw + sx) * 4 + c))
                    .map(|i| u32::from(src[i]))
                    .sum();
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

/// Packs texture pages into a container.
///
/// Each page is compressed independently; a page whose LZ4 output is not small
/// enough is stored raw, which shows up as `compressedSize == originalSize`.
///
/// # Arguments
///
/// * `format` - Pixel format of every page
/// * `extents` - Page sizes, finest first
/// * `pixels` - All pages concatenated in the same order
/// * `source_file` - Provenance recorded in the metadata
///
/// # Errors
///
/// Returns [`AssetError::InvalidInput`] for an unknown format, a broken mip chain,
/// or a pixel buffer whose length does not match the pages.
pub fn pack_texture(
    format: TextureFormat,
    extents: &[PageExtent],
    pixels: &[u8],
    source_file: &str,
) -> AssetResult<AssetContainer> {
    let _timer = ScopedTimer::new("pack texture");

    let bpp = format
        .bytes_per_pixel()
        .ok_or_else(|| AssetError::InvalidInput("unknown texture format".to_owned()))?;
    if extents.is_empty() {
        return Err(AssetError::InvalidInput("texture needs at least one page".to_owned()));
    }
    validate_mip_chain(extents)?;

    let sizes: Vec<u64> = extents.iter().map(|e| e.pixel_count() * bpp).collect();
    let buffer_size: u64 = sizes.iter().sum();
    if pixels.len() as u64 != buffer_size {
        return Err(AssetError::InvalidInput(format!(
            "{} pages need {} bytes, got {}",
            extents.len(),
            buffer_size,
            pixels.len()
        )));
    }

    let mut payload = Vec::new();
    let mut pages = Vec::with_capacity(extents.len());
    let mut offset = 0usize;

    for (extent, &size) in extents.iter().zip(&sizes) {
        let page_bytes = &pixels[offset..offset + size as usize];
        offset += size as usize;

        let unit = compression::compress(page_bytes);
        pages.push(PageInfo {
            width: extent.width,
            height: extent.height,
            compressed_size: unit.bytes.len() as u64,
            original_size: size,
        });
        payload.extend_from_slice(&unit.bytes);
    }

    let raw_pages = pages.iter().filter(|p| p.is_raw()).count();
    debug!(
        "Packed {} texture '{}' {}x{}: {} pages ({} raw), {} -> {} bytes",
        format,
        source_file,
        extents[0].width,
        extents[0].height,
        pages.len(),
        raw_pages,
        buffer_size,
        payload.len()
    );

    let metadata = TextureMetadata {
        format: format.as_str().to_owned(),
        compression: CompressionMode::Lz4,
        buffer_size,
        source_file: source_file.to_owned(),
        pages,
    };

    Ok(AssetContainer::new(
        AssetType::TEXTURE,
        TEXTURE_CONTENT_VERSION,
        serde_json::to_string(&metadata)?,
        payload,
    ))
}

/// Decodes every page into `dst`, which must be `buffer_size` bytes long.
pub fn unpack_texture(info: &TextureInfo, payload: &[u8], dst: &mut [u8]) -> AssetResult<()> {
    let _timer = ScopedTimer::new("unpack texture");

    if dst.len() as u64 != info.buffer_size {
        return Err(AssetError::InvalidInput(format!(
            "destination holds {} bytes, texture needs {}",
            dst.len(),
            info.buffer_size
        )));
    }
    check_payload(info, payload)?;

    let mut src_offset = 0usize;
    let mut dst_offset = 0usize;
    for page in &info.pages {
        let src = &payload[src_offset..src_offset + page.compressed_size as usize];
        let out = &mut dst[dst_offset..dst_offset + page.original_size as usize];
        compression::decompress_into(info.page_mode(page), src, out)?;
        src_offset += page.compressed_size as usize;
        dst_offset += page.original_size as usize;
    }
    Ok(())
}

/// Decodes a single page into `dst`, which must be that page's original size.
///
/// The page is located by summing the compressed sizes of the pages before it.
pub fn unpack_texture_page(
    info: &TextureInfo,
    page_index: usize,
    payload: &[u8],
    dst: &mut [u8],
) -> AssetResult<()> {
    let page = info.pages.get(page_index).ok_or_else(|| {
        AssetError::InvalidInput(format!(
            "page {} out of range ({} pages)",
            page_index,
            info.pages.len()
        ))
    })?;
    if dst.len() as u64 != page.original_size {
        return Err(AssetError::InvalidInput(format!(
            "destination holds {} bytes, page {} needs {}",
            dst.len(),
            page_index,
            page.original_size
        )));
    }
    check_payload(info, payload)?;

    let offset = info.page_offset(page_index).unwrap_or(0) as usize;
    let src = &payload[offset..offset + page.compressed_size as usize];
    compression::decompress_into(info.page_mode(page), src, dst)
}

fn check_payload(info: &TextureInfo, payload: &[u8]) -> AssetResult<()> {
    let expected = info.payload_size();
    if payload.len() as u64 != expected {
        return Err(AssetError::Corrupt(format!(
            "page table covers {} bytes but payload holds {}",
            expected,
            payload.len()
        )));
    }
    Ok(())
}

/// A texture read back from a container, all pages decoded.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub info: TextureInfo,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn from_container(container: &AssetContainer) -> AssetResult<Self> {
        let info = TextureInfo::read(container)?;
        let mut pixels = compression::alloc_output(info.buffer_size)?;
        unpack_texture(&info, container.payload(), &mut pixels)?;
        Ok(Self { info, pixels })
    }

    /// Loads and unpacks a `.tex` file.
    pub fn load(path: &Path) -> AssetResult<Self> {
        Self::from_container(&AssetContainer::load(path)?)
    }

    /// Decoded bytes of one page.
    pub fn page(&self, page_index: usize) -> Option<&[u8]> {
        let start = self.info.page_output_offset(page_index)? as usize;
        let len = self.info.pages[page_index].original_size as usize;
        self.pixels.get(start..start + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_mip_chain_extents() {
        let extents = mip_chain_extents(8, 2);
        assert_eq!(
            extents,
            vec![
                PageExtent::new(8, 2),
                PageExtent::new(4, 1),
                PageExtent::new(2, 1),
                PageExtent::new(1, 1),
            ]
        );
        assert_eq!(mip_chain_extents(1, 1), vec![PageExtent::new(1, 1)]);
    }

    #[test]
    fn test_validate_mip_chain() {
        assert!(validate_mip_chain(&[PageExtent::new(4, 4), PageExtent::new(2, 2)]).is_ok());
        assert!(validate_mip_chain(&[PageExtent::new(4, 4), PageExtent::new(3, 2)]).is_err());
        assert!(validate_mip_chain(&[PageExtent::new(0, 4)]).is_err());
    }

    #[test]
    fn test_generate_mip_chain_box_filter() {
        // 2x2 image: black, white, white, black -> one gray pixel
        let rgba = [
            0, 0, 0, 255, 255, 255, 255, 255, //
            255, 255, 255, 255, 0, 0, 0, 255,
        ];
        let (extents, pixels) = generate_mip_chain(2, 2, &rgba).unwrap();
        assert_eq!(extents.len(), 2);
        assert_eq!(pixels.len(), 16 + 4);
        assert_eq!(&pixels[16..], &[128, 128, 128, 255]);
    }

    #[test]
    fn test_round_trip_pages_match_whole_buffer() {
        let extents = mip_chain_extents(16, 8);
        let total: usize = extents.iter().map(|e| e.pixel_count() as usize * 4).sum();
        // compressible first page, noisy rest
        let mut pixels = vec![9u8; 16 * 8 * 4];
        pixels.extend(noise(total - pixels.len(), 7));

        let container = pack_texture(TextureFormat::Rgba8, &extents, &pixels, "t.png").unwrap();
        let info = TextureInfo::read(&container).unwrap();
        assert_eq!(info.pages.len(), extents.len());
        assert!(!info.pages[0].is_raw());
        assert!(info.pages[1].is_raw());

        let mut whole = vec![0u8; info.buffer_size as usize];
        unpack_texture(&info, container.payload(), &mut whole).unwrap();
        assert_eq!(whole, pixels);

        for (i, page) in info.pages.iter().enumerate() {
            let mut out = vec![0u8; page.original_size as usize];
            unpack_texture_page(&info, i, container.payload(), &mut out).unwrap();
            let start = info.page_output_offset(i).unwrap() as usize;
            assert_eq!(out, &whole[start..start + out.len()], "page {i}");
        }
    }

    #[test]
    fn test_page_offsets_are_prefix_sums() {
        let extents = mip_chain_extents(4, 4);
        let pixels = vec![0u8; extents.iter().map(|e| e.pixel_count() as usize * 4).sum()];
        let container = pack_texture(TextureFormat::Rgba8, &extents, &pixels, "").unwrap();
        let info = TextureInfo::read(&container).unwrap();

        assert_eq!(info.page_offset(0), Some(0));
        assert_eq!(info.page_offset(1), Some(info.pages[0].compressed_size));
        assert_eq!(
            info.page_offset(2),
            Some(info.pages[0].compressed_size + info.pages[1].compressed_size)
        );
        assert_eq!(info.page_offset(3), None);
        assert_eq!(info.payload_size(), container.payload().len() as u64);
    }

    #[test]
    fn test_none_compression_reads_raw() {
        let extents = [PageExtent::new(2, 2), PageExtent::new(1, 1)];
        let pixels: Vec<u8> = (0..20).collect();
        let meta = serde_json::json!({
            "format": "RGBA8",
            "compression": "something-new",
            "bufferSize": 20,
            "sourceFile": "",
            "pages": [
                {"width": 2, "height": 2, "compressedSize": 16, "originalSize": 16},
                {"width": 1, "height": 1, "compressedSize": 4, "originalSize": 4},
            ],
        });
        let container = AssetContainer::new(
            AssetType::TEXTURE,
            TEXTURE_CONTENT_VERSION,
            meta.to_string(),
            pixels.clone(),
        );
        let texture = TextureData::from_container(&container).unwrap();
        assert_eq!(texture.info.compression, CompressionMode::None);
        assert_eq!(texture.pixels, pixels);
        assert_eq!(texture.page(1), Some(&pixels[16..20]));
        assert_eq!(extents[1], texture.info.pages[1].extent());
    }

    fn texture_meta(format: &str, page: serde_json::Value, buffer_size: u64) -> AssetContainer {
        let meta = serde_json::json!({
            "format": format,
            "compression": "LZ4",
            "bufferSize": buffer_size,
            "sourceFile": "",
            "pages": [page],
        });
        AssetContainer::new(
            AssetType::TEXTURE,
            TEXTURE_CONTENT_VERSION,
            meta.to_string(),
            vec![0; 16],
        )
    }

    #[test]
    fn test_overflowing_page_extent_is_corrupt() {
        let page = serde_json::json!({
            "width": u32::MAX, "height": u32::MAX, "compressedSize": 16, "originalSize": 16,
        });
        let container = texture_meta("RGBA8", page, 16);
        assert!(matches!(
            TextureData::from_container(&container),
            Err(AssetError::Corrupt(_))
        ));
    }

    #[test]
    fn test_implausible_page_size_is_corrupt() {
        let huge = 1u64 << 60;
        let page = serde_json::json!({
            "width": 1, "height": 1, "compressedSize": 16, "originalSize": huge,
        });
        let container = texture_meta("BC7", page, huge);
        assert!(matches!(
            TextureData::from_container(&container),
            Err(AssetError::Corrupt(_))
        ));
    }

    #[test]
    fn test_pack_rejects_bad_input() {
        let extents = [PageExtent::new(2, 2)];
        assert!(pack_texture(TextureFormat::Unknown, &extents, &[0; 16], "").is_err());
        assert!(pack_texture(TextureFormat::Rgba8, &extents, &[0; 15], "").is_err());
        assert!(pack_texture(TextureFormat::Rgba8, &[], &[], "").is_err());
        let broken = [PageExtent::new(4, 4), PageExtent::new(1, 1)];
        assert!(pack_texture(TextureFormat::Rgba8, &broken, &[0; 68], "").is_err());
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let extents = [PageExtent::new(2, 2)];
        let container = pack_texture(TextureFormat::Rgba8, &extents, &noise(16, 3), "").unwrap();
        let info = TextureInfo::read(&container).unwrap();
        let mut out = vec![0u8; 16];
        let short = &container.payload()[..container.payload().len() - 1];
        assert!(matches!(
            unpack_texture(&info, short, &mut out),
            Err(AssetError::Corrupt(_))
        ));
    }
}
