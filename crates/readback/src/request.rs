use std::time::Duration;

use capture_protocol::{CaptureKind, CaptureView, ImageExtent, PixelBuffer, RenderRequestId};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

#[derive(Debug)]
struct FrameBuffers {
    raw: PixelBuffer,
    segmentation: PixelBuffer,
}

/// Writer half of an in-flight request.
///
/// Dropping a sink without calling [`ReadbackSink::complete`] fails the request.
#[derive(Debug)]
pub struct ReadbackSink {
    request_id: RenderRequestId,
    kind: CaptureKind,
    view: CaptureView,
    buffers: FrameBuffers,
    completion: Sender<FrameBuffers>,
}

impl ReadbackSink {
    pub fn request_id(&self) -> RenderRequestId {
        self.request_id
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn view(&self) -> CaptureView {
        self.view
    }

    pub fn extent(&self) -> ImageExtent {
        self.buffers.raw.extent()
    }

    pub fn raw_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffers.raw
    }

    pub fn segmentation_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffers.segmentation
    }

    pub fn buffers_mut(&mut self) -> (&mut PixelBuffer, &mut PixelBuffer) {
        (&mut self.buffers.raw, &mut self.buffers.segmentation)
    }

    /// Signals the fence and hands both buffers back to the request.
    pub fn complete(self) {
        let request_id = self.request_id;
        if self.completion.send(self.buffers).is_err() {
            tracing::debug!(%request_id, "readback completed after its request was abandoned");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Allocated,
    InFlight,
    Complete,
    Failed,
}

#[derive(Debug)]
enum RequestState {
    Allocated(FrameBuffers),
    InFlight(Receiver<FrameBuffers>),
    Ready(FrameBuffers),
    Failed,
}

/// One outstanding frame transfer, owned by the frame buffer pool.
#[derive(Debug)]
pub struct RenderRequest {
    id: RenderRequestId,
    kind: CaptureKind,
    extent: ImageExtent,
    view: CaptureView,
    issued_tick: u64,
    state: RequestState,
}

impl RenderRequest {
    pub(crate) fn allocate(
        id: RenderRequestId,
        kind: CaptureKind,
        extent: ImageExtent,
        issued_tick: u64,
    ) -> Self {
        Self {
            id,
            kind,
            extent,
            view: CaptureView::default(),
            issued_tick,
            state: RequestState::Allocated(FrameBuffers {
                raw: PixelBuffer::zeroed(extent),
                segmentation: PixelBuffer::zeroed(extent),
            }),
        }
    }

    pub fn id(&self) -> RenderRequestId {
        self.id
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn extent(&self) -> ImageExtent {
        self.extent
    }

    pub fn view(&self) -> CaptureView {
        self.view
    }

    pub fn issued_tick(&self) -> u64 {
        self.issued_tick
    }

    pub fn status(&self) -> RequestStatus {
        match self.state {
            RequestState::Allocated(_) => RequestStatus::Allocated,
            RequestState::InFlight(_) => RequestStatus::InFlight,
            RequestState::Ready(_) => RequestStatus::Complete,
            RequestState::Failed => RequestStatus::Failed,
        }
    }

    /// Moves the buffers into a writer half. Returns `None` unless the request is
    /// still allocated.
    pub(crate) fn begin(&mut self, view: CaptureView) -> Option<ReadbackSink> {
        let buffers = match std::mem::replace(&mut self.state, RequestState::Failed) {
            RequestState::Allocated(buffers) => buffers,
            other => {
                self.state = other;
                return None;
            }
        };
        let (completion, receiver) = crossbeam_channel::bounded(1);
        self.view = view;
        self.state = RequestState::InFlight(receiver);
        Some(ReadbackSink {
            request_id: self.id,
            kind: self.kind,
            view,
            buffers,
            completion,
        })
    }

    /// Non-blocking fence poll.
    pub fn poll(&mut self) -> RequestStatus {
        if let RequestState::InFlight(receiver) = &self.state {
            match receiver.try_recv() {
                Ok(buffers) => self.state = RequestState::Ready(buffers),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.state = RequestState::Failed,
            }
        }
        self.status()
    }

    /// Blocks for at most `timeout` waiting on the fence. Only used at shutdown.
    pub fn wait(&mut self, timeout: Duration) -> RequestStatus {
        if let RequestState::InFlight(receiver) = &self.state {
            match receiver.recv_timeout(timeout) {
                Ok(buffers) => self.state = RequestState::Ready(buffers),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.state = RequestState::Failed,
            }
        }
        self.status()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, RequestState::Ready(_))
    }

    /// Converts a completed request into its frame. Any other state is handed back.
    pub fn into_completed(self) -> Result<CompletedFrame, RenderRequest> {
        match self.state {
            RequestState::Ready(buffers) => Ok(CompletedFrame {
                id: self.id,
                kind: self.kind,
                view: self.view,
                issued_tick: self.issued_tick,
                raw: buffers.raw,
                segmentation: buffers.segmentation,
            }),
            state => Err(Self { state, ..self }),
        }
    }
}

/// Fully written frame, detached from any writer.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub id: RenderRequestId,
    pub kind: CaptureKind,
    pub view: CaptureView,
    pub issued_tick: u64,
    pub raw: PixelBuffer,
    pub segmentation: PixelBuffer,
}

impl CompletedFrame {
    pub fn extent(&self) -> ImageExtent {
        self.raw.extent()
    }
}

#[cfg(test)]
mod tests {
    use capture_protocol::Pixel;

    use super::*;

    fn request(width: u32, height: u32) -> RenderRequest {
        RenderRequest::allocate(
            RenderRequestId(1),
            CaptureKind::Segmentation,
            ImageExtent::new(width, height),
            0,
        )
    }

    #[test]
    fn allocated_buffers_are_zeroed_and_sized() {
        let mut request = request(3, 2);
        let mut sink = request.begin(CaptureView::default()).expect("sink");

        assert_eq!(sink.raw_mut().pixels().len(), 6);
        assert_eq!(sink.segmentation_mut().pixels().len(), 6);
        assert!(sink.raw_mut().pixels().iter().all(|p| *p == Pixel::TRANSPARENT));
    }

    #[test]
    fn request_is_not_complete_until_sink_completes() {
        let mut request = request(2, 1);
        let mut sink = request.begin(CaptureView::default()).expect("sink");
        assert_eq!(request.poll(), RequestStatus::InFlight);
        assert!(!request.is_complete());

        sink.raw_mut().pixels_mut()[1] = Pixel::GREEN;
        sink.complete();

        assert_eq!(request.poll(), RequestStatus::Complete);
        let frame = request.into_completed().expect("completed frame");
        assert_eq!(frame.raw.pixels()[1], Pixel::GREEN);
    }

    #[test]
    fn dropped_sink_fails_request() {
        let mut request = request(2, 1);
        let sink = request.begin(CaptureView::default()).expect("sink");
        drop(sink);

        assert_eq!(request.poll(), RequestStatus::Failed);
        assert!(request.into_completed().is_err());
    }

    #[test]
    fn begin_only_once() {
        let mut request = request(1, 1);
        let _sink = request.begin(CaptureView::default()).expect("first sink");
        assert!(request.begin(CaptureView::default()).is_none());
    }

    #[test]
    fn wait_times_out_while_writer_holds_buffers() {
        let mut request = request(1, 1);
        let _sink = request.begin(CaptureView::default()).expect("sink");

        let status = request.wait(Duration::from_millis(5));
        assert_eq!(status, RequestStatus::InFlight);
    }
}
