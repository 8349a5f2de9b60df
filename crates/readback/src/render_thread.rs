use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use capture_protocol::{CaptureView, ImageExtent};

use crate::{ReadbackError, ReadbackSink, ReadbackSource};

/// Draws the color and segmentation passes of one frame into a sink.
pub trait FrameRenderer: Send + 'static {
    fn render(&mut self, sink: &mut ReadbackSink);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderThreadConfig {
    pub extent: ImageExtent,
    pub submit_queue_capacity: usize,
    /// Simulated copy latency applied before each sink is completed.
    pub readback_latency: Duration,
}

impl Default for RenderThreadConfig {
    fn default() -> Self {
        Self {
            extent: ImageExtent::new(640, 360),
            submit_queue_capacity: 2,
            readback_latency: Duration::from_millis(20),
        }
    }
}

/// [`ReadbackSource`] backed by a dedicated render thread fed through an SPSC ring.
pub struct RenderThreadSource {
    extent: ImageExtent,
    view: CaptureView,
    producer: rtrb::Producer<ReadbackSink>,
    stop_requested: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl RenderThreadSource {
    pub fn start<R: FrameRenderer>(
        config: RenderThreadConfig,
        renderer: R,
    ) -> Result<Self, ReadbackError> {
        if config.extent.is_empty() {
            return Err(ReadbackError::EmptyExtent(config.extent));
        }
        let (producer, consumer) = rtrb::RingBuffer::new(config.submit_queue_capacity.max(1));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let worker_stop_requested = Arc::clone(&stop_requested);
        let readback_latency = config.readback_latency;

        let join_handle = std::thread::Builder::new()
            .name("render_thread".to_owned())
            .spawn(move || {
                render_thread_loop(renderer, readback_latency, worker_stop_requested, consumer)
            })
            .map_err(|error| ReadbackError::RenderThreadSpawn(error.to_string()))?;

        Ok(Self {
            extent: config.extent,
            view: CaptureView::default(),
            producer,
            stop_requested,
            join_handle: Some(join_handle),
        })
    }

    pub fn set_view(&mut self, view: CaptureView) {
        self.view = view;
    }

    fn worker_alive(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|join_handle| !join_handle.is_finished())
    }
}

impl ReadbackSource for RenderThreadSource {
    fn extent(&self) -> ImageExtent {
        self.extent
    }

    fn capture_view(&self) -> CaptureView {
        self.view
    }

    fn submit_readback(&mut self, sink: ReadbackSink) -> Result<(), ReadbackError> {
        if !self.worker_alive() {
            return Err(ReadbackError::RenderThreadStopped);
        }
        self.producer
            .push(sink)
            .map_err(|_| ReadbackError::SubmitQueueFull)
    }
}

impl Drop for RenderThreadSource {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(join_handle) = self.join_handle.take()
            && join_handle.join().is_err()
        {
            tracing::error!("render thread panicked");
        }
    }
}

fn render_thread_loop<R: FrameRenderer>(
    mut renderer: R,
    readback_latency: Duration,
    stop_requested: Arc<AtomicBool>,
    mut consumer: rtrb::Consumer<ReadbackSink>,
) {
    const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(1);

    while !stop_requested.load(Ordering::Acquire) {
        let Ok(mut sink) = consumer.pop() else {
            std::thread::sleep(IDLE_SLEEP_DURATION);
            continue;
        };
        renderer.render(&mut sink);
        if !readback_latency.is_zero() {
            std::thread::sleep(readback_latency);
        }
        tracing::trace!(request = %sink.request_id(), "render thread completed readback");
        sink.complete();
    }
    // Sinks still queued are dropped here, which fails their requests.
}
