//! Pipeline configuration, loaded once at startup and never mutated afterwards.

mod class_map;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capture_protocol::{IMAGE_EVENT_NAME, ImageExtent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use class_map::{ClassEntry, ClassMap, ClassSlot, TREE_STENCIL_ID, WALL_STENCIL_ID};

pub const DEFAULT_FRAME_MOD: u32 = 5;
pub const DEFAULT_MODEL_IMAGE: ImageExtent = ImageExtent::new(400, 400);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] serde_json::Error),
    #[error("frame_mod must be greater than zero")]
    ZeroFrameMod,
    #[error("model image extent {0} has a zero dimension")]
    EmptyModelImage(ImageExtent),
    #[error("instance name must not be empty")]
    EmptyInstanceName,
    #[error("event name must not be empty")]
    EmptyEventName,
    #[error("class map entry for stencil {stencil_id} has an empty tag")]
    EmptyTag { stencil_id: u8 },
    #[error("tag {tag:?} is bound to more than one display color")]
    ConflictingTagColor { tag: String },
    #[error("overlay alpha {0} is outside [0, 1]")]
    AlphaOutOfRange(f32),
    #[error("transport capacity must be greater than zero")]
    ZeroTransportCapacity,
}

/// Debug overlay that stamps projected actor outlines onto the classified image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    pub tags: Vec<String>,
    pub radius: u32,
    pub alpha: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tags: vec!["Tree".to_owned(), "Wall".to_owned()],
            radius: 1,
            alpha: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Prefix for the outbound image names (`<instance>_1`, `<instance>_2`).
    pub instance_name: String,
    pub event_name: String,
    /// A capture is issued on every tick divisible by this value.
    pub frame_mod: u32,
    pub model_image: ImageExtent,
    pub class_map: ClassMap,
    pub overlay: OverlayConfig,
    pub transport_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instance_name: "default".to_owned(),
            event_name: IMAGE_EVENT_NAME.to_owned(),
            frame_mod: DEFAULT_FRAME_MOD,
            model_image: DEFAULT_MODEL_IMAGE,
            class_map: ClassMap::default(),
            overlay: OverlayConfig::default(),
            transport_capacity: 16,
            shutdown_timeout_ms: 500,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(
            path = %path.display(),
            instance = %config.instance_name,
            frame_mod = config.frame_mod,
            classes = config.class_map.len(),
            "loaded pipeline config"
        );
        Ok(config)
    }

    /// Class map entries are checked when the map is built, so this only covers
    /// the scalar fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_mod == 0 {
            return Err(ConfigError::ZeroFrameMod);
        }
        if self.model_image.is_empty() {
            return Err(ConfigError::EmptyModelImage(self.model_image));
        }
        if self.instance_name.is_empty() {
            return Err(ConfigError::EmptyInstanceName);
        }
        if self.event_name.is_empty() {
            return Err(ConfigError::EmptyEventName);
        }
        if !(0.0..=1.0).contains(&self.overlay.alpha) {
            return Err(ConfigError::AlphaOutOfRange(self.overlay.alpha));
        }
        if self.transport_capacity == 0 {
            return Err(ConfigError::ZeroTransportCapacity);
        }
        Ok(())
    }

    pub fn shared_class_map(&self) -> Arc<ClassMap> {
        Arc::new(self.class_map.clone())
    }
}

#[cfg(test)]
mod tests {
    use capture_protocol::Pixel;

    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = PipelineConfig::from_json_str(r#"{ "instance_name": "mower" }"#)
            .expect("parse partial config");

        assert_eq!(config.instance_name, "mower");
        assert_eq!(config.event_name, "imageJson");
        assert_eq!(config.frame_mod, 5);
        assert_eq!(config.model_image, ImageExtent::new(400, 400));
        assert_eq!(config.class_map, ClassMap::default());
        assert!(!config.overlay.enabled);
    }

    #[test]
    fn class_map_parses_from_stencil_keyed_object() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "class_map": {
                    "7": { "tag": "Rock", "color": { "r": 0, "g": 255, "b": 0, "a": 255 } }
                }
            }"#,
        )
        .expect("parse class map");

        let entry = config.class_map.get(7).expect("stencil 7");
        assert_eq!(entry.tag, "Rock");
        assert_eq!(entry.color, Pixel::GREEN);
        assert!(config.class_map.lookup(133).is_none());
    }

    #[test]
    fn zero_frame_mod_is_rejected() {
        let error = PipelineConfig::from_json_str(r#"{ "frame_mod": 0 }"#)
            .expect_err("frame_mod 0 must fail");
        assert!(matches!(error, ConfigError::ZeroFrameMod));
    }

    #[test]
    fn empty_model_image_is_rejected() {
        let error = PipelineConfig::from_json_str(
            r#"{ "model_image": { "width": 0, "height": 400 } }"#,
        )
        .expect_err("zero width must fail");
        assert!(matches!(error, ConfigError::EmptyModelImage(_)));
    }

    #[test]
    fn overlay_alpha_outside_unit_range_is_rejected() {
        let error = PipelineConfig::from_json_str(r#"{ "overlay": { "alpha": 1.5 } }"#)
            .expect_err("alpha 1.5 must fail");
        assert!(matches!(error, ConfigError::AlphaOutOfRange(alpha) if alpha == 1.5));
    }

    #[test]
    fn conflicting_tag_colors_fail_to_parse() {
        let error = PipelineConfig::from_json_str(
            r#"{
                "class_map": {
                    "1": { "tag": "Wall", "color": { "r": 255, "g": 0, "b": 0, "a": 255 } },
                    "2": { "tag": "Wall", "color": { "r": 0, "g": 0, "b": 255, "a": 255 } }
                }
            }"#,
        )
        .expect_err("conflicting colors must fail");
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn bundled_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/pipeline.json");
        let config = PipelineConfig::load(&path).expect("load sample config");
        assert_eq!(config.instance_name, "mower");
        assert_eq!(config.class_map, ClassMap::default());
        assert_eq!(config.overlay, OverlayConfig::default());
    }

    #[test]
    fn load_reports_missing_file_path() {
        let error = PipelineConfig::load("/nonexistent/capture-pipeline.json")
            .expect_err("missing file must fail");
        match error {
            ConfigError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/capture-pipeline.json"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
