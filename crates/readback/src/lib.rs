//! Asynchronous GPU to CPU frame transfers.
//!
//! A [`RenderRequest`] owns the raw and segmentation buffers of one capture.
//! Issuing it moves both buffers into a [`ReadbackSink`] handed to a
//! [`ReadbackSource`]; the buffers only come back through the request's
//! completion channel once the writer has finished with them, so a reader can
//! never observe a partially written frame.

#[cfg(any(test, feature = "test-helpers"))]
mod manual;
mod pool;
mod render_thread;
mod request;
#[cfg(feature = "wgpu-readback")]
mod wgpu_source;

use capture_protocol::{CaptureView, ImageExtent, RenderRequestId};
use thiserror::Error;

#[cfg(any(test, feature = "test-helpers"))]
pub use manual::{ManualReadbackController, ManualReadbackSource};
pub use pool::{FrameBufferPool, FrameBufferPoolStats, ShutdownOutcome};
pub use render_thread::{FrameRenderer, RenderThreadConfig, RenderThreadSource};
pub use request::{CompletedFrame, ReadbackSink, RenderRequest, RequestStatus};
#[cfg(feature = "wgpu-readback")]
pub use wgpu_source::{WgpuReadbackSource, WgpuReadbackTargets};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadbackError {
    #[error("capture extent {0} has a zero dimension")]
    EmptyExtent(ImageExtent),
    #[error("{0} is still in flight")]
    RequestInFlight(RenderRequestId),
    #[error("request extent {request} does not match source extent {source_extent}")]
    ExtentMismatch {
        request: ImageExtent,
        source_extent: ImageExtent,
    },
    #[error("readback submit queue is full")]
    SubmitQueueFull,
    #[error("render thread has stopped")]
    RenderThreadStopped,
    #[error("failed to spawn render thread: {0}")]
    RenderThreadSpawn(String),
    #[error("render device error: {0}")]
    Device(String),
}

/// Render target that can copy its color and segmentation passes back to the CPU.
pub trait ReadbackSource: Send {
    /// Current size of the render target. Cached into the request at issue time.
    fn extent(&self) -> ImageExtent;

    fn capture_view(&self) -> CaptureView {
        CaptureView::default()
    }

    /// Starts an asynchronous readback. Must return without waiting for the copy;
    /// the writer completes `sink` once both buffers are written, or drops it on
    /// failure.
    fn submit_readback(&mut self, sink: ReadbackSink) -> Result<(), ReadbackError>;

    /// Non-blocking progress hook, called once per tick before completion is polled.
    fn poll_device(&mut self) {}
}
