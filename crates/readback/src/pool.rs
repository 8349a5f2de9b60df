use std::time::Duration;

use capture_protocol::{CaptureKind, ImageExtent, RenderRequestId};

use crate::request::{CompletedFrame, RenderRequest, RequestStatus};
use crate::{ReadbackError, ReadbackSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameBufferPoolStats {
    pub created: u64,
    pub issued: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Idle,
    /// The fence was satisfied (or the writer went away) and the buffers were freed.
    Released(RenderRequestId),
    /// The writer still holds the buffers; they are freed on its side when it finishes.
    Abandoned(RenderRequestId),
}

/// Owns at most one in-flight [`RenderRequest`].
#[derive(Debug, Default)]
pub struct FrameBufferPool {
    next_request_id: u64,
    in_flight: Option<RenderRequest>,
    stats: FrameBufferPoolStats,
}

impl FrameBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FrameBufferPoolStats {
        self.stats
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&RenderRequest> {
        self.in_flight.as_ref()
    }

    /// Allocates zeroed raw and segmentation buffers for a capture of `extent`.
    pub fn create_request(
        &mut self,
        extent: ImageExtent,
        kind: CaptureKind,
        tick: u64,
    ) -> Result<RenderRequest, ReadbackError> {
        if extent.is_empty() {
            return Err(ReadbackError::EmptyExtent(extent));
        }
        let id = RenderRequestId(self.next_request_id);
        self.next_request_id = self
            .next_request_id
            .checked_add(1)
            .expect("render request id overflow");
        self.stats.created = self
            .stats
            .created
            .checked_add(1)
            .expect("render request created count overflow");
        Ok(RenderRequest::allocate(id, kind, extent, tick))
    }

    /// Hands the request's buffers to `source` and retains the request until it
    /// is drained. Returns immediately.
    pub fn issue(
        &mut self,
        mut request: RenderRequest,
        source: &mut dyn ReadbackSource,
    ) -> Result<RenderRequestId, ReadbackError> {
        if let Some(in_flight) = &self.in_flight {
            return Err(ReadbackError::RequestInFlight(in_flight.id()));
        }
        let source_extent = source.extent();
        if request.extent() != source_extent {
            return Err(ReadbackError::ExtentMismatch {
                request: request.extent(),
                source_extent,
            });
        }
        let Some(sink) = request.begin(source.capture_view()) else {
            return Err(ReadbackError::RequestInFlight(request.id()));
        };
        source.submit_readback(sink)?;

        let id = request.id();
        tracing::debug!(
            request = %id,
            kind = ?request.kind(),
            extent = %request.extent(),
            tick = request.issued_tick(),
            "readback issued"
        );
        self.stats.issued = self
            .stats
            .issued
            .checked_add(1)
            .expect("render request issued count overflow");
        self.in_flight = Some(request);
        Ok(id)
    }

    /// Non-blocking fence poll. A request whose writer vanished is discarded here.
    pub fn is_complete(&mut self) -> bool {
        let Some(request) = self.in_flight.as_mut() else {
            return false;
        };
        match request.poll() {
            RequestStatus::Complete => true,
            RequestStatus::Failed => {
                tracing::warn!(
                    request = %request.id(),
                    tick = request.issued_tick(),
                    "readback writer dropped without completing, discarding request"
                );
                self.in_flight = None;
                self.stats.failed = self
                    .stats
                    .failed
                    .checked_add(1)
                    .expect("render request failed count overflow");
                false
            }
            RequestStatus::Allocated | RequestStatus::InFlight => false,
        }
    }

    /// Yields the in-flight frame only once its fence has been observed.
    pub fn take_completed(&mut self) -> Option<CompletedFrame> {
        if !self.in_flight.as_ref().is_some_and(RenderRequest::is_complete) {
            return None;
        }
        let request = self.in_flight.take()?;
        match request.into_completed() {
            Ok(frame) => {
                self.stats.completed = self
                    .stats
                    .completed
                    .checked_add(1)
                    .expect("render request completed count overflow");
                Some(frame)
            }
            Err(request) => {
                self.in_flight = Some(request);
                None
            }
        }
    }

    /// Waits up to `timeout` for the pending fence before releasing the request.
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownOutcome {
        let Some(mut request) = self.in_flight.take() else {
            return ShutdownOutcome::Idle;
        };
        let id = request.id();
        match request.wait(timeout) {
            RequestStatus::Complete | RequestStatus::Failed | RequestStatus::Allocated => {
                tracing::debug!(request = %id, "released pending readback at shutdown");
                ShutdownOutcome::Released(id)
            }
            RequestStatus::InFlight => {
                tracing::warn!(
                    request = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "readback fence not satisfied before shutdown timeout, leaving buffers with writer"
                );
                self.stats.abandoned = self
                    .stats
                    .abandoned
                    .checked_add(1)
                    .expect("render request abandoned count overflow");
                ShutdownOutcome::Abandoned(id)
            }
        }
    }
}
