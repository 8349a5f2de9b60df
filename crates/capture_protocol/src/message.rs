use serde::{Deserialize, Serialize};

/// Outbound event carrying a processed capture.
pub const IMAGE_EVENT_NAME: &str = "imageJson";
/// Inbound event the perception server answers with.
pub const PROCESSED_IMAGE_EVENT_NAME: &str = "processedImage";

/// Payload of one `imageJson` event. Field names on the wire are fixed by the
/// perception server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMessage {
    #[serde(rename = "name1")]
    pub raw_name: String,
    #[serde(rename = "name2")]
    pub classified_name: String,
    #[serde(rename = "image1")]
    pub raw_png_base64: String,
    #[serde(rename = "image2")]
    pub classified_png_base64: String,
    #[serde(rename = "arr2")]
    pub pixel_locations: Vec<u32>,
}

impl ImageMessage {
    pub fn raw_name_for(instance_name: &str) -> String {
        format!("{instance_name}_1")
    }

    pub fn classified_name_for(instance_name: &str) -> String {
        format!("{instance_name}_2")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedImageResponse {
    pub name: String,
    pub left_throttle: f32,
    pub right_throttle: f32,
}

impl ProcessedImageResponse {
    pub fn drive_command(&self) -> DriveCommand {
        DriveCommand {
            left_throttle: self.left_throttle,
            right_throttle: self.right_throttle,
        }
        .clamped()
    }
}

/// Differential throttle pair for the vehicle, each side in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveCommand {
    pub left_throttle: f32,
    pub right_throttle: f32,
}

impl DriveCommand {
    pub fn clamped(self) -> Self {
        fn clamp_side(value: f32) -> f32 {
            if value.is_nan() {
                return 0.0;
            }
            value.clamp(-1.0, 1.0)
        }
        Self {
            left_throttle: clamp_side(self.left_throttle),
            right_throttle: clamp_side(self.right_throttle),
        }
    }
}
