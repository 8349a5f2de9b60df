//! Shared pixel, frame and wire types for the capture pipeline.
//!
//! Every crate in the workspace speaks in these types: the readback side fills
//! [`PixelBuffer`]s, the classifier produces [`PixelLocations`], and the emitter
//! turns both into an [`ImageMessage`].

mod message;

use std::collections::BTreeMap;
use std::fmt;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use message::{
    DriveCommand, IMAGE_EVENT_NAME, ImageMessage, PROCESSED_IMAGE_EVENT_NAME,
    ProcessedImageResponse,
};

/// 8-bit RGBA sample. In segmentation buffers `r` carries the stencil id.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable, Serialize, Deserialize,
)]
pub struct Pixel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

static_assertions::assert_eq_size!(Pixel, [u8; 4]);
static_assertions::assert_eq_align!(Pixel, u8);

impl Pixel {
    pub const TRANSPARENT: Pixel = Pixel::new(0, 0, 0, 0);
    pub const BLACK: Pixel = Pixel::opaque(0, 0, 0);
    pub const WHITE: Pixel = Pixel::opaque(255, 255, 255);
    pub const RED: Pixel = Pixel::opaque(255, 0, 0);
    pub const GREEN: Pixel = Pixel::opaque(0, 255, 0);
    pub const BLUE: Pixel = Pixel::opaque(0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    /// A segmentation pass pixel with the given stencil id.
    pub const fn stencil(stencil_id: u8) -> Self {
        Self::opaque(stencil_id, 0, 0)
    }

    pub const fn stencil_id(self) -> u8 {
        self.r
    }
}

/// Width and height of a captured or model image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageExtent {
    pub width: u32,
    pub height: u32,
}

impl ImageExtent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(self) -> usize {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .expect("image extent pixel count overflow")
    }

    /// Row-major index to pixel coordinate.
    pub fn coord_of(self, index: usize) -> PixelCoord {
        debug_assert!(self.width > 0, "coord_of on an empty extent");
        let width = self.width as usize;
        PixelCoord::new((index % width) as u32, (index / width) as u32)
    }

    pub fn index_of(self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    pub fn contains(self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
    }
}

impl fmt::Display for ImageExtent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PixelBufferError {
    #[error("pixel buffer for {extent} needs {expected} pixels, got {actual}")]
    LengthMismatch {
        extent: ImageExtent,
        expected: usize,
        actual: usize,
    },
}

/// Row-major pixel storage whose length always matches its extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    extent: ImageExtent,
    pixels: Vec<Pixel>,
}

impl PixelBuffer {
    pub fn zeroed(extent: ImageExtent) -> Self {
        Self::filled(extent, Pixel::TRANSPARENT)
    }

    pub fn filled(extent: ImageExtent, pixel: Pixel) -> Self {
        Self {
            extent,
            pixels: vec![pixel; extent.pixel_count()],
        }
    }

    pub fn from_pixels(extent: ImageExtent, pixels: Vec<Pixel>) -> Result<Self, PixelBufferError> {
        let expected = extent.pixel_count();
        if pixels.len() != expected {
            return Err(PixelBufferError::LengthMismatch {
                extent,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { extent, pixels })
    }

    pub fn extent(&self) -> ImageExtent {
        self.extent
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Pixel] {
        &mut self.pixels
    }

    pub fn into_pixels(self) -> Vec<Pixel> {
        self.pixels
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Pixel> {
        self.extent
            .index_of(x, y)
            .map(|index| self.pixels[index])
    }
}

/// Which capture component drove a readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureKind {
    Color,
    Segmentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderRequestId(pub u64);

impl fmt::Display for RenderRequestId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "request#{}", self.0)
    }
}

/// Camera state snapshotted when a capture is issued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureView {
    pub view_projection: Mat4,
}

impl CaptureView {
    pub fn new(view_projection: Mat4) -> Self {
        Self { view_projection }
    }
}

impl Default for CaptureView {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: u32,
    pub y: u32,
}

impl PixelCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Per-tag pixel coordinates collected while classifying one frame.
///
/// Tags iterate in sorted order so the flattened wire form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PixelLocations {
    by_tag: BTreeMap<String, Vec<PixelCoord>>,
}

impl PixelLocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.by_tag.clear();
    }

    pub fn push(&mut self, tag: &str, coord: PixelCoord) {
        match self.by_tag.get_mut(tag) {
            Some(coords) => coords.push(coord),
            None => {
                self.by_tag.insert(tag.to_owned(), vec![coord]);
            }
        }
    }

    pub fn extend_tag<I>(&mut self, tag: &str, coords: I)
    where
        I: IntoIterator<Item = PixelCoord>,
    {
        let mut coords = coords.into_iter().peekable();
        if coords.peek().is_none() {
            return;
        }
        match self.by_tag.get_mut(tag) {
            Some(existing) => existing.extend(coords),
            None => {
                self.by_tag.insert(tag.to_owned(), coords.collect());
            }
        }
    }

    pub fn get(&self, tag: &str) -> Option<&[PixelCoord]> {
        self.by_tag.get(tag).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PixelCoord])> {
        self.by_tag
            .iter()
            .map(|(tag, coords)| (tag.as_str(), coords.as_slice()))
    }

    pub fn tag_count(&self) -> usize {
        self.by_tag.len()
    }

    pub fn total_pixels(&self) -> usize {
        self.by_tag.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Length-prefixed concatenation: for every tag, the number of values that
    /// follow (two per pixel) and then `x0, y0, x1, y1, ...`.
    pub fn flatten(&self) -> Vec<u32> {
        let value_count: usize = self
            .by_tag
            .values()
            .map(|coords| 1 + coords.len() * 2)
            .sum();
        let mut flattened = Vec::with_capacity(value_count);
        for coords in self.by_tag.values() {
            let prefix = u32::try_from(coords.len() * 2).expect("pixel location count exceeds u32");
            flattened.push(prefix);
            for coord in coords {
                flattened.push(coord.x);
                flattened.push(coord.y);
            }
        }
        flattened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_maps_indices_row_major() {
        let extent = ImageExtent::new(4, 3);
        assert_eq!(extent.pixel_count(), 12);
        assert_eq!(extent.coord_of(0), PixelCoord::new(0, 0));
        assert_eq!(extent.coord_of(3), PixelCoord::new(3, 0));
        assert_eq!(extent.coord_of(5), PixelCoord::new(1, 1));
        assert_eq!(extent.index_of(1, 1), Some(5));
        assert_eq!(extent.index_of(4, 0), None);
        assert!(extent.contains(3, 2));
        assert!(!extent.contains(-1, 0));
    }

    #[test]
    fn pixel_buffer_rejects_length_mismatch() {
        let extent = ImageExtent::new(2, 2);
        let error = PixelBuffer::from_pixels(extent, vec![Pixel::RED; 3])
            .expect_err("three pixels cannot fill a 2x2 buffer");
        assert_eq!(
            error,
            PixelBufferError::LengthMismatch {
                extent,
                expected: 4,
                actual: 3,
            }
        );
    }

    #[test]
    fn pixel_buffer_bytes_are_rgba_interleaved() {
        let buffer = PixelBuffer::from_pixels(
            ImageExtent::new(2, 1),
            vec![Pixel::new(1, 2, 3, 4), Pixel::new(5, 6, 7, 8)],
        )
        .expect("buffer");
        assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.get(1, 0), Some(Pixel::new(5, 6, 7, 8)));
    }

    #[test]
    fn flatten_prefixes_each_tag_with_its_value_count() {
        let mut locations = PixelLocations::new();
        locations.push("Wall", PixelCoord::new(0, 0));
        locations.push("Tree", PixelCoord::new(1, 0));
        locations.push("Wall", PixelCoord::new(3, 0));

        assert_eq!(locations.tag_count(), 2);
        assert_eq!(locations.total_pixels(), 3);
        assert_eq!(locations.flatten(), vec![2, 1, 0, 4, 0, 0, 3, 0]);
    }

    #[test]
    fn extend_tag_ignores_empty_runs() {
        let mut locations = PixelLocations::new();
        locations.extend_tag("Wall", std::iter::empty());
        assert!(locations.is_empty());
        assert!(locations.flatten().is_empty());

        locations.extend_tag("Wall", [PixelCoord::new(2, 5)]);
        assert_eq!(locations.get("Wall"), Some(&[PixelCoord::new(2, 5)][..]));
    }
}
