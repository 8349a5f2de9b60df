use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSchedulerConfig {
    /// A capture is due on every tick divisible by this value.
    pub frame_mod: u32,
}

impl Default for CaptureSchedulerConfig {
    fn default() -> Self {
        Self { frame_mod: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSchedulerInput {
    pub tick: u64,
    pub request_in_flight: bool,
    /// Completion token of the in-flight request. Ignored when nothing is in flight.
    pub request_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSkipReason {
    OffCadence,
    RequestInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSchedulerDecision {
    pub tick: u64,
    /// Drain the in-flight request. Always applied before `issue_capture`.
    pub drain_request: bool,
    pub issue_capture: bool,
    pub skip_reason: Option<CaptureSkipReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureSchedulerStats {
    pub ticks: u64,
    pub issued: u64,
    pub drained: u64,
    pub skipped_in_flight: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("tick {tick} does not follow previous tick {previous}")]
    NonMonotonicTick { previous: u64, tick: u64 },
}

#[derive(Debug, Clone)]
pub struct CaptureScheduler {
    config: CaptureSchedulerConfig,
    last_tick: Option<u64>,
    stats: CaptureSchedulerStats,
}

impl CaptureScheduler {
    pub fn new(config: CaptureSchedulerConfig) -> Self {
        if config.frame_mod == 0 {
            panic!("invalid capture scheduler config: frame_mod must be greater than zero");
        }
        Self {
            config,
            last_tick: None,
            stats: CaptureSchedulerStats::default(),
        }
    }

    pub fn config(&self) -> CaptureSchedulerConfig {
        self.config
    }

    pub fn stats(&self) -> CaptureSchedulerStats {
        self.stats
    }

    pub fn last_tick(&self) -> Option<u64> {
        self.last_tick
    }

    pub fn is_cadence_tick(&self, tick: u64) -> bool {
        tick % u64::from(self.config.frame_mod) == 0
    }

    pub fn schedule_tick(
        &mut self,
        input: CaptureSchedulerInput,
    ) -> Result<CaptureSchedulerDecision, SchedulerError> {
        if let Some(previous) = self.last_tick
            && input.tick <= previous
        {
            return Err(SchedulerError::NonMonotonicTick {
                previous,
                tick: input.tick,
            });
        }
        self.last_tick = Some(input.tick);
        self.stats.ticks = self
            .stats
            .ticks
            .checked_add(1)
            .expect("capture scheduler tick count overflow");

        let drain_request = input.request_in_flight && input.request_complete;
        let still_in_flight = input.request_in_flight && !drain_request;
        if drain_request {
            self.stats.drained = self
                .stats
                .drained
                .checked_add(1)
                .expect("capture scheduler drain count overflow");
        }

        if !self.is_cadence_tick(input.tick) {
            return Ok(CaptureSchedulerDecision {
                tick: input.tick,
                drain_request,
                issue_capture: false,
                skip_reason: Some(CaptureSkipReason::OffCadence),
            });
        }

        if still_in_flight {
            self.stats.skipped_in_flight = self
                .stats
                .skipped_in_flight
                .checked_add(1)
                .expect("capture scheduler skip count overflow");
            tracing::debug!(tick = input.tick, "capture skipped, request still in flight");
            return Ok(CaptureSchedulerDecision {
                tick: input.tick,
                drain_request,
                issue_capture: false,
                skip_reason: Some(CaptureSkipReason::RequestInFlight),
            });
        }

        self.stats.issued = self
            .stats
            .issued
            .checked_add(1)
            .expect("capture scheduler issue count overflow");
        Ok(CaptureSchedulerDecision {
            tick: input.tick,
            drain_request,
            issue_capture: true,
            skip_reason: None,
        })
    }
}

impl Default for CaptureScheduler {
    fn default() -> Self {
        Self::new(CaptureSchedulerConfig::default())
    }
}
