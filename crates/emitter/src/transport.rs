use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use serde_json::Value;

use crate::EmitError;

/// Outbound event sink. `send` must not block and never reports delivery.
pub trait MessageTransport: Send {
    fn send(&mut self, event_name: &str, payload: Value);
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event_name: String,
    pub payload: Value,
}

// Single producer (the emitter) and single consumer (the transport owner).
struct SharedMailbox {
    // When full we evict the oldest event and keep the newest.
    queue: ArrayQueue<OutboundEvent>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

pub struct ChannelTransport {
    shared: Arc<SharedMailbox>,
}

pub struct ChannelReceiver {
    shared: Arc<SharedMailbox>,
}

pub fn channel_transport(capacity: usize) -> Result<(ChannelTransport, ChannelReceiver), EmitError> {
    if capacity == 0 {
        return Err(EmitError::ZeroTransportCapacity);
    }
    let shared = Arc::new(SharedMailbox {
        queue: ArrayQueue::new(capacity),
        pushed: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    Ok((
        ChannelTransport {
            shared: Arc::clone(&shared),
        },
        ChannelReceiver { shared },
    ))
}

impl MessageTransport for ChannelTransport {
    fn send(&mut self, event_name: &str, payload: Value) {
        let mut pending_event = OutboundEvent {
            event_name: event_name.to_owned(),
            payload,
        };
        loop {
            match self.shared.queue.push(pending_event) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(returned_event) => {
                    pending_event = returned_event;
                    if self.shared.queue.pop().is_some() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(event = event_name, "transport mailbox full, dropped oldest event");
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}

impl ChannelTransport {
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl ChannelReceiver {
    pub fn pop(&self) -> Option<OutboundEvent> {
        self.shared.queue.pop()
    }

    /// Appends every queued event to `output`.
    pub fn drain_into(&self, output: &mut Vec<OutboundEvent>) -> usize {
        let mut drained = 0;
        while let Some(event) = self.shared.queue.pop() {
            output.push(event);
            drained += 1;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn pushed_events(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    event: &'a str,
    payload: &'a Value,
}

/// Writes one `{"event": ..., "payload": ...}` JSON object per line.
///
/// Write failures are logged and swallowed.
pub struct JsonLinesTransport<W: Write + Send> {
    writer: W,
    written: u64,
    failed: u64,
}

impl<W: Write + Send> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            written: 0,
            failed: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, event_name: &str, payload: &Value) -> std::io::Result<()> {
        serde_json::to_writer(
            &mut self.writer,
            &EventLine {
                event: event_name,
                payload,
            },
        )?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write + Send> MessageTransport for JsonLinesTransport<W> {
    fn send(&mut self, event_name: &str, payload: Value) {
        match self.write_line(event_name, &payload) {
            Ok(()) => self.written += 1,
            Err(error) => {
                self.failed += 1;
                tracing::warn!(event = event_name, %error, "failed to write event line");
            }
        }
    }
}
