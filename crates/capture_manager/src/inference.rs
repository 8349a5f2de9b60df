use std::time::{Duration, Instant};

use capture_protocol::{ImageExtent, PixelBuffer, RenderRequestId};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};
use task_queue::BackgroundTask;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("snapshot of {actual} does not match screen extent {expected}")]
    SnapshotMismatch {
        expected: ImageExtent,
        actual: ImageExtent,
    },
    #[error("model extent {0} has a zero dimension")]
    EmptyModelImage(ImageExtent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSummary {
    pub request_id: RenderRequestId,
    pub model_image: ImageExtent,
    /// Per-channel mean of the downsized frame, each in `[0, 255]`.
    pub mean_rgb: [f32; 3],
    pub elapsed: Duration,
}

/// Placeholder for model inference: downsizes the raw frame to the model input
/// size and summarizes it.
#[derive(Debug)]
pub struct InferenceTask {
    request_id: RenderRequestId,
    raw: PixelBuffer,
    screen_image: ImageExtent,
    model_image: ImageExtent,
}

impl InferenceTask {
    pub fn new(
        request_id: RenderRequestId,
        raw: PixelBuffer,
        screen_image: ImageExtent,
        model_image: ImageExtent,
    ) -> Self {
        Self {
            request_id,
            raw,
            screen_image,
            model_image,
        }
    }
}

impl BackgroundTask for InferenceTask {
    type Output = Result<InferenceSummary, InferenceError>;

    fn run(self) -> Self::Output {
        let started = Instant::now();
        if self.model_image.is_empty() {
            return Err(InferenceError::EmptyModelImage(self.model_image));
        }
        let mismatch = InferenceError::SnapshotMismatch {
            expected: self.screen_image,
            actual: self.raw.extent(),
        };
        if self.raw.extent() != self.screen_image {
            return Err(mismatch);
        }
        let frame: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_raw(
            self.screen_image.width,
            self.screen_image.height,
            self.raw.as_bytes().to_vec(),
        )
        .ok_or(mismatch)?;
        let resized = imageops::resize(
            &frame,
            self.model_image.width,
            self.model_image.height,
            FilterType::Triangle,
        );

        let mut sums = [0u64; 3];
        for pixel in resized.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += u64::from(channel);
            }
        }
        let count = self.model_image.pixel_count() as f64;
        Ok(InferenceSummary {
            request_id: self.request_id,
            model_image: self.model_image,
            mean_rgb: sums.map(|sum| (sum as f64 / count) as f32),
            elapsed: started.elapsed(),
        })
    }
}
