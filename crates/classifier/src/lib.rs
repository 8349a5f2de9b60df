//! Stencil classification of captured frames.
//!
//! The segmentation pass writes each object's class stencil id into the red
//! channel. [`StencilClassifier`] recolors the raw frame wherever that id is
//! known and records which pixels belong to which tag.

mod projection;

use std::sync::Arc;

use capture_config::ClassMap;
use capture_protocol::{ImageExtent, PixelBuffer, PixelCoord, PixelLocations};
use rayon::prelude::*;
use thiserror::Error;

pub use projection::{ActorId, OverlayReport, ProjectionOverlay, SceneQuery, blend_over, world_to_screen};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("raw extent {raw} does not match segmentation extent {segmentation}")]
    ExtentMismatch {
        raw: ImageExtent,
        segmentation: ImageExtent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub classified: PixelBuffer,
    pub locations: PixelLocations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassifyStats {
    pub total_pixels: usize,
    pub classified_pixels: usize,
}

#[derive(Debug, Clone)]
pub struct StencilClassifier {
    class_map: Arc<ClassMap>,
}

impl StencilClassifier {
    pub fn new(class_map: Arc<ClassMap>) -> Self {
        Self { class_map }
    }

    pub fn class_map(&self) -> &ClassMap {
        &self.class_map
    }

    pub fn classify(
        &self,
        raw: &PixelBuffer,
        segmentation: &PixelBuffer,
    ) -> Result<Classification, ClassifyError> {
        let mut classified = raw.clone();
        let mut locations = PixelLocations::new();
        self.classify_into(raw, segmentation, &mut classified, &mut locations)?;
        Ok(Classification {
            classified,
            locations,
        })
    }

    /// Writes the classified image into `output` and rebuilds `locations`.
    ///
    /// `output` starts as a copy of `raw`; pixels whose stencil id is unknown are
    /// left byte-identical. Coordinates within each tag come out in row-major order.
    pub fn classify_into(
        &self,
        raw: &PixelBuffer,
        segmentation: &PixelBuffer,
        output: &mut PixelBuffer,
        locations: &mut PixelLocations,
    ) -> Result<ClassifyStats, ClassifyError> {
        let extent = raw.extent();
        if extent != segmentation.extent() {
            return Err(ClassifyError::ExtentMismatch {
                raw: extent,
                segmentation: segmentation.extent(),
            });
        }
        if output.extent() == extent {
            output.pixels_mut().copy_from_slice(raw.pixels());
        } else {
            *output = raw.clone();
        }
        locations.clear();

        let total_pixels = extent.pixel_count();
        if total_pixels == 0 || self.class_map.is_empty() {
            return Ok(ClassifyStats {
                total_pixels,
                classified_pixels: 0,
            });
        }

        let width = extent.width as usize;
        let class_map = &*self.class_map;
        let row_hits: Vec<Vec<(u16, PixelCoord)>> = output
            .pixels_mut()
            .par_chunks_mut(width)
            .zip(segmentation.pixels().par_chunks(width))
            .enumerate()
            .map(|(y, (output_row, segmentation_row))| {
                let mut hits = Vec::new();
                for (x, (pixel, stencil)) in output_row.iter_mut().zip(segmentation_row).enumerate()
                {
                    if let Some(slot) = class_map.lookup(stencil.stencil_id()) {
                        *pixel = slot.color;
                        hits.push((slot.tag_index, PixelCoord::new(x as u32, y as u32)));
                    }
                }
                hits
            })
            .collect();

        let mut by_tag: Vec<Vec<PixelCoord>> = vec![Vec::new(); class_map.tags().len()];
        let mut classified_pixels = 0;
        for hits in row_hits {
            classified_pixels += hits.len();
            for (tag_index, coord) in hits {
                by_tag[usize::from(tag_index)].push(coord);
            }
        }
        for (tag_index, coords) in by_tag.into_iter().enumerate() {
            locations.extend_tag(&class_map.tags()[tag_index], coords);
        }

        tracing::trace!(
            extent = %extent,
            classified_pixels,
            tags = locations.tag_count(),
            "classified frame"
        );
        Ok(ClassifyStats {
            total_pixels,
            classified_pixels,
        })
    }
}
