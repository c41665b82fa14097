//! Declarative layer configuration.
//!
//! Records deserialize from JSON, for example:
//!
//! ```json
//! { "type": "convolution", "kernel_width": 5, "kernel_height": 5,
//!   "output_channels": 16, "horizontal_stride": 1, "vertical_stride": 1,
//!   "zero_padding": true }
//! ```

use crate::error::{ConvError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionConfig {
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub output_channels: usize,
    pub horizontal_stride: usize,
    pub vertical_stride: usize,
    #[serde(default)]
    pub zero_padding: bool,
    /// Samples packed at once; 0 packs the whole batch.
    #[serde(default)]
    pub max_temp_batch_size: usize,
}

impl ConvolutionConfig {
    /// Reject zero-sized kernels, strides and channel counts.
    pub fn check(&self) -> Result<()> {
        let fields = [
            ("kernel_width", self.kernel_width),
            ("kernel_height", self.kernel_height),
            ("output_channels", self.output_channels),
            ("horizontal_stride", self.horizontal_stride),
            ("vertical_stride", self.vertical_stride),
        ];
        check_positive("ConvolutionConfig", &fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingConfig {
    pub window_width: usize,
    pub window_height: usize,
    pub horizontal_stride: usize,
    pub vertical_stride: usize,
}

impl PoolingConfig {
    pub fn check(&self) -> Result<()> {
        let fields = [
            ("window_width", self.window_width),
            ("window_height", self.window_height),
            ("horizontal_stride", self.horizontal_stride),
            ("vertical_stride", self.vertical_stride),
        ];
        check_positive("PoolingConfig", &fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Convolution(ConvolutionConfig),
    MaxPooling(PoolingConfig),
    AveragePooling(PoolingConfig),
}

impl LayerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ConvError::invalid_argument("LayerConfig::from_json", e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ConvError::invalid_argument("LayerConfig::from_file", format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }
}

fn check_positive(operation: &str, fields: &[(&str, usize)]) -> Result<()> {
    match fields.iter().find(|(_, v)| *v == 0) {
        Some((name, _)) => Err(ConvError::invalid_argument(operation, format!("{} must be positive", name))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convolution_defaults() {
        let config = LayerConfig::from_json(
            r#"{"type":"convolution","kernel_width":3,"kernel_height":3,
                "output_channels":8,"horizontal_stride":1,"vertical_stride":1}"#,
        )
        .unwrap();
        match config {
            LayerConfig::Convolution(c) => {
                assert!(!c.zero_padding);
                assert_eq!(c.max_temp_batch_size, 0);
                c.check().unwrap();
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn pooling_variants_and_zero_fields() {
        let config = LayerConfig::from_json(
            r#"{"type":"average_pooling","window_width":2,"window_height":2,
                "horizontal_stride":0,"vertical_stride":2}"#,
        )
        .unwrap();
        let LayerConfig::AveragePooling(p) = config else {
            panic!("expected average pooling");
        };
        assert!(p.check().unwrap_err().is_invalid_argument());
        assert!(LayerConfig::from_json("{\"type\":\"dropout\"}").is_err());
    }
}
