//! Packages processed captures into `imageJson` events.
//!
//! Both images are PNG-encoded in memory, base64-encoded, and sent together with
//! the flattened per-tag pixel locations. Sending is fire-and-forget: the
//! transport never reports delivery back.

mod encode;
mod transport;

use capture_protocol::{ImageExtent, ImageMessage, PixelBuffer, PixelLocations};
use thiserror::Error;

pub use encode::{encode_png, encode_png_base64};
pub use transport::{
    ChannelReceiver, ChannelTransport, JsonLinesTransport, MessageTransport, OutboundEvent,
    channel_transport,
};

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("cannot encode empty image {0}")]
    EmptyImage(ImageExtent),
    #[error("png encoding failed")]
    Png(#[from] image::ImageError),
    #[error("failed to serialize image message")]
    Serialize(#[from] serde_json::Error),
    #[error("transport capacity must be greater than zero")]
    ZeroTransportCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitterStats {
    pub emitted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitReport {
    pub raw_encoded_len: usize,
    pub classified_encoded_len: usize,
    pub location_values: usize,
}

pub struct NetworkEmitter {
    instance_name: String,
    event_name: String,
    transport: Box<dyn MessageTransport>,
    stats: EmitterStats,
}

impl NetworkEmitter {
    pub fn new(
        instance_name: impl Into<String>,
        event_name: impl Into<String>,
        transport: Box<dyn MessageTransport>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            event_name: event_name.into(),
            transport,
            stats: EmitterStats::default(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn stats(&self) -> EmitterStats {
        self.stats
    }

    pub fn build_message(
        &self,
        raw: &PixelBuffer,
        classified: &PixelBuffer,
        locations: &PixelLocations,
    ) -> Result<ImageMessage, EmitError> {
        Ok(ImageMessage {
            raw_name: ImageMessage::raw_name_for(&self.instance_name),
            classified_name: ImageMessage::classified_name_for(&self.instance_name),
            raw_png_base64: encode_png_base64(raw)?,
            classified_png_base64: encode_png_base64(classified)?,
            pixel_locations: locations.flatten(),
        })
    }

    /// Builds the message and hands it to the transport without waiting.
    pub fn emit(
        &mut self,
        raw: &PixelBuffer,
        classified: &PixelBuffer,
        locations: &PixelLocations,
    ) -> Result<EmitReport, EmitError> {
        let message = match self.build_message(raw, classified, locations) {
            Ok(message) => message,
            Err(error) => {
                self.stats.failed = self
                    .stats
                    .failed
                    .checked_add(1)
                    .expect("emitter failure count overflow");
                return Err(error);
            }
        };
        let report = EmitReport {
            raw_encoded_len: message.raw_png_base64.len(),
            classified_encoded_len: message.classified_png_base64.len(),
            location_values: message.pixel_locations.len(),
        };
        let payload = serde_json::to_value(&message)?;
        self.transport.send(&self.event_name, payload);
        self.stats.emitted = self
            .stats
            .emitted
            .checked_add(1)
            .expect("emitter emit count overflow");
        tracing::debug!(
            event = %self.event_name,
            name = %message.raw_name,
            location_values = report.location_values,
            "image message emitted"
        );
        Ok(report)
    }
}
