use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use capture_protocol::{CaptureView, ImageExtent};

use crate::{ReadbackError, ReadbackSink, ReadbackSource};

#[derive(Debug, Default)]
struct ManualState {
    pending: VecDeque<ReadbackSink>,
    submitted: u64,
    view: CaptureView,
    reject_submits: bool,
}

/// Source that parks every sink until a test completes or fails it.
#[derive(Debug)]
pub struct ManualReadbackSource {
    extent: ImageExtent,
    state: Arc<Mutex<ManualState>>,
}

/// Test-side handle controlling the sinks a [`ManualReadbackSource`] holds.
#[derive(Debug, Clone)]
pub struct ManualReadbackController {
    state: Arc<Mutex<ManualState>>,
}

impl ManualReadbackSource {
    pub fn new(extent: ImageExtent) -> (Self, ManualReadbackController) {
        let state = Arc::new(Mutex::new(ManualState::default()));
        (
            Self {
                extent,
                state: Arc::clone(&state),
            },
            ManualReadbackController { state },
        )
    }
}

fn lock(state: &Mutex<ManualState>) -> MutexGuard<'_, ManualState> {
    state.lock().expect("manual readback state poisoned")
}

impl ReadbackSource for ManualReadbackSource {
    fn extent(&self) -> ImageExtent {
        self.extent
    }

    fn capture_view(&self) -> CaptureView {
        lock(&self.state).view
    }

    fn submit_readback(&mut self, sink: ReadbackSink) -> Result<(), ReadbackError> {
        let mut state = lock(&self.state);
        if state.reject_submits {
            return Err(ReadbackError::Device("manual source rejecting submits".to_owned()));
        }
        state.submitted += 1;
        state.pending.push_back(sink);
        Ok(())
    }
}

impl ManualReadbackController {
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn submitted_count(&self) -> u64 {
        lock(&self.state).submitted
    }

    pub fn set_view(&self, view: CaptureView) {
        lock(&self.state).view = view;
    }

    pub fn set_reject_submits(&self, reject: bool) {
        lock(&self.state).reject_submits = reject;
    }

    /// Fills the oldest pending sink and signals its fence.
    pub fn complete_next(&self, fill: impl FnOnce(&mut ReadbackSink)) -> bool {
        let Some(mut sink) = lock(&self.state).pending.pop_front() else {
            return false;
        };
        fill(&mut sink);
        sink.complete();
        true
    }

    /// Drops the oldest pending sink without completing it.
    pub fn fail_next(&self) -> bool {
        lock(&self.state).pending.pop_front().is_some()
    }
}
