//! Per-tick orchestration of the capture pipeline.
//!
//! Each tick the [`CaptureManager`] polls the in-flight readback, asks the
//! scheduler what to do, drains a completed frame through classification and
//! emission, issues the next capture when due, and pumps the background queue.
//! Failures are logged and counted; nothing escapes the tick.

mod inference;
pub mod synthetic;

use std::sync::Arc;
use std::time::Duration;

use capture_config::{ConfigError, PipelineConfig};
use capture_protocol::{
    CaptureKind, DriveCommand, ImageExtent, PROCESSED_IMAGE_EVENT_NAME, PixelBuffer,
    PixelLocations, ProcessedImageResponse, RenderRequestId,
};
use classifier::{ProjectionOverlay, SceneQuery, StencilClassifier};
use emitter::{EmitterStats, MessageTransport, NetworkEmitter};
use frame_scheduler::{
    CaptureScheduler, CaptureSchedulerConfig, CaptureSchedulerInput, CaptureSchedulerStats,
    CaptureSkipReason,
};
use readback::{CompletedFrame, FrameBufferPool, FrameBufferPoolStats, ReadbackSource, ShutdownOutcome};
use task_queue::{BackgroundTaskQueue, TaskId, TaskOutcome, TaskQueueError, TaskQueueStats};
use thiserror::Error;

pub use inference::{InferenceError, InferenceSummary, InferenceTask};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid pipeline config")]
    Config(#[from] ConfigError),
    #[error("failed to start background task queue")]
    TaskQueue(#[from] TaskQueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManagerStats {
    pub ticks: u64,
    pub captures_issued: u64,
    pub frames_processed: u64,
    pub issue_failures: u64,
    pub classify_failures: u64,
    pub emit_failures: u64,
    pub missing_target: u64,
    pub inference_completed: u64,
    pub inference_failed: u64,
    pub drive_commands: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub drained: Option<RenderRequestId>,
    pub emitted: bool,
    pub issued: Option<RenderRequestId>,
    pub skip_reason: Option<CaptureSkipReason>,
    pub task_started: Option<TaskId>,
    pub task_finished: Option<TaskId>,
}

impl TickReport {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            drained: None,
            emitted: false,
            issued: None,
            skip_reason: None,
            task_started: None,
            task_finished: None,
        }
    }
}

pub struct CaptureManager {
    config: PipelineConfig,
    scheduler: CaptureScheduler,
    pool: FrameBufferPool,
    source: Option<Box<dyn ReadbackSource>>,
    classifier: StencilClassifier,
    overlay: Option<ProjectionOverlay>,
    scene_query: Option<Arc<dyn SceneQuery>>,
    emitter: NetworkEmitter,
    tasks: BackgroundTaskQueue<InferenceTask>,
    classified: PixelBuffer,
    locations: PixelLocations,
    next_tick: u64,
    missing_target_reported: bool,
    latest_drive_command: Option<DriveCommand>,
    latest_inference: Option<InferenceSummary>,
    stats: ManagerStats,
}

impl CaptureManager {
    pub fn new(
        config: PipelineConfig,
        source: Option<Box<dyn ReadbackSource>>,
        transport: Box<dyn MessageTransport>,
        scene_query: Option<Arc<dyn SceneQuery>>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let overlay = match (config.overlay.enabled, scene_query.is_some()) {
            (true, true) => Some(ProjectionOverlay::from_config(&config.overlay)),
            (true, false) => {
                tracing::warn!("projection overlay enabled without a scene query, overlay disabled");
                None
            }
            (false, _) => None,
        };
        let emitter = NetworkEmitter::new(
            config.instance_name.clone(),
            config.event_name.clone(),
            transport,
        );
        Ok(Self {
            scheduler: CaptureScheduler::new(CaptureSchedulerConfig {
                frame_mod: config.frame_mod,
            }),
            pool: FrameBufferPool::new(),
            source,
            classifier: StencilClassifier::new(config.shared_class_map()),
            overlay,
            scene_query,
            emitter,
            tasks: BackgroundTaskQueue::new()?,
            classified: PixelBuffer::zeroed(ImageExtent::new(0, 0)),
            locations: PixelLocations::new(),
            next_tick: 0,
            missing_target_reported: false,
            latest_drive_command: None,
            latest_inference: None,
            stats: ManagerStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    pub fn scheduler_stats(&self) -> CaptureSchedulerStats {
        self.scheduler.stats()
    }

    pub fn pool_stats(&self) -> FrameBufferPoolStats {
        self.pool.stats()
    }

    pub fn emitter_stats(&self) -> EmitterStats {
        self.emitter.stats()
    }

    pub fn task_stats(&self) -> TaskQueueStats {
        self.tasks.stats()
    }

    pub fn has_capture_target(&self) -> bool {
        self.source.is_some()
    }

    pub fn has_request_in_flight(&self) -> bool {
        self.pool.has_in_flight()
    }

    pub fn is_task_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }

    pub fn latest_drive_command(&self) -> Option<DriveCommand> {
        self.latest_drive_command
    }

    pub fn latest_inference(&self) -> Option<&InferenceSummary> {
        self.latest_inference.as_ref()
    }

    /// Swaps the render target. A request issued against the old target fails
    /// once that target drops its sink, and is discarded on a later tick.
    pub fn set_capture_target(&mut self, source: Option<Box<dyn ReadbackSource>>) {
        self.source = source;
    }

    pub fn on_tick(&mut self) -> TickReport {
        let tick = self.next_tick;
        self.next_tick = self
            .next_tick
            .checked_add(1)
            .expect("capture manager tick overflow");
        self.stats.ticks = self
            .stats
            .ticks
            .checked_add(1)
            .expect("capture manager tick count overflow");
        let mut report = TickReport::new(tick);

        if let Some(source) = self.source.as_deref_mut() {
            source.poll_device();
        }
        // Polling first may discard a failed request, so read in-flight afterwards.
        let request_complete = self.pool.is_complete();
        let request_in_flight = self.pool.has_in_flight();

        let decision = match self.scheduler.schedule_tick(CaptureSchedulerInput {
            tick,
            request_in_flight,
            request_complete,
        }) {
            Ok(decision) => decision,
            Err(error) => {
                tracing::error!(%error, "capture scheduler rejected tick");
                return report;
            }
        };
        report.skip_reason = decision.skip_reason;

        if decision.drain_request
            && let Some(frame) = self.pool.take_completed()
        {
            report.drained = Some(frame.id);
            report.emitted = self.process_frame(frame);
        }
        if decision.issue_capture {
            report.issued = self.issue_capture(tick);
        }

        let pump = self.tasks.pump();
        report.task_started = pump.started;
        report.task_finished = pump.finished;
        if pump.finished.is_some() {
            self.collect_inference();
        }
        report
    }

    /// Applies a message from the perception server. Returns the new drive
    /// command when the event was a `processedImage` response for this instance.
    pub fn handle_server_event(
        &mut self,
        event_name: &str,
        payload: &serde_json::Value,
    ) -> Option<DriveCommand> {
        if event_name != PROCESSED_IMAGE_EVENT_NAME {
            tracing::debug!(event = event_name, "ignoring unknown server event");
            return None;
        }
        let response: ProcessedImageResponse = match serde_json::from_value(payload.clone()) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "malformed processedImage response");
                return None;
            }
        };
        if !response.name.starts_with(&self.config.instance_name) {
            tracing::debug!(name = %response.name, "processedImage response for another instance");
            return None;
        }
        let command = response.drive_command();
        self.latest_drive_command = Some(command);
        self.stats.drive_commands = self
            .stats
            .drive_commands
            .checked_add(1)
            .expect("drive command count overflow");
        tracing::debug!(
            left = command.left_throttle,
            right = command.right_throttle,
            "drive command received"
        );
        Some(command)
    }

    /// Waits up to `timeout` for the pending readback before releasing it, then
    /// stops the background worker.
    pub fn shutdown(mut self, timeout: Duration) -> ShutdownOutcome {
        let outcome = self.pool.shutdown(timeout);
        tracing::info!(
            ?outcome,
            ticks = self.stats.ticks,
            frames = self.stats.frames_processed,
            "capture manager shut down"
        );
        outcome
    }

    fn process_frame(&mut self, frame: CompletedFrame) -> bool {
        if let Err(error) = self.classifier.classify_into(
            &frame.raw,
            &frame.segmentation,
            &mut self.classified,
            &mut self.locations,
        ) {
            tracing::warn!(request = %frame.id, %error, "classification failed, frame skipped");
            self.stats.classify_failures += 1;
            return false;
        }
        if let (Some(overlay), Some(scene_query)) = (&self.overlay, &self.scene_query) {
            overlay.apply(
                scene_query.as_ref(),
                &frame.view.view_projection,
                &mut self.classified,
            );
        }
        self.stats.frames_processed += 1;

        let emitted = match self
            .emitter
            .emit(&frame.raw, &self.classified, &self.locations)
        {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(request = %frame.id, %error, "emit failed, frame skipped");
                self.stats.emit_failures += 1;
                false
            }
        };

        let screen_image = frame.extent();
        let enqueued = self.tasks.enqueue(InferenceTask::new(
            frame.id,
            frame.raw,
            screen_image,
            self.config.model_image,
        ));
        if let Some(replaced) = enqueued.replaced {
            tracing::debug!(task = replaced.0, "inference task superseded by newer frame");
        }
        emitted
    }

    fn issue_capture(&mut self, tick: u64) -> Option<RenderRequestId> {
        let Some(source) = self.source.as_deref_mut() else {
            self.stats.missing_target += 1;
            if !self.missing_target_reported {
                tracing::warn!(tick, "no capture target set, skipping capture");
                self.missing_target_reported = true;
            }
            return None;
        };
        if self.missing_target_reported {
            tracing::info!(tick, "capture target available again");
            self.missing_target_reported = false;
        }

        let request = match self
            .pool
            .create_request(source.extent(), CaptureKind::Segmentation, tick)
        {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(tick, %error, "failed to allocate capture");
                self.stats.issue_failures += 1;
                return None;
            }
        };
        match self.pool.issue(request, source) {
            Ok(id) => {
                self.stats.captures_issued += 1;
                Some(id)
            }
            Err(error) => {
                tracing::warn!(tick, %error, "failed to issue capture");
                self.stats.issue_failures += 1;
                None
            }
        }
    }

    fn collect_inference(&mut self) {
        let Some(finished) = self.tasks.take_finished() else {
            return;
        };
        match finished.outcome {
            TaskOutcome::Completed(Ok(summary)) => {
                tracing::debug!(
                    request = %summary.request_id,
                    elapsed_ms = finished.elapsed.as_millis() as u64,
                    mean_rgb = ?summary.mean_rgb,
                    "inference finished"
                );
                self.stats.inference_completed += 1;
                self.latest_inference = Some(summary);
            }
            TaskOutcome::Completed(Err(error)) => {
                tracing::warn!(%error, "inference failed");
                self.stats.inference_failed += 1;
            }
            TaskOutcome::Panicked(_) => {
                self.stats.inference_failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests;
