//! Render settings
//!
//! Everything has a default, so a settings file only needs the fields it
//! changes:
//!
//! ```json
//! { "gc": { "max_unused_ms": 120000 }, "uniform_batch": { "min_alignment": 256 } }
//! ```

use crate::error::{ConfigError, UniformError};
use serde::{Deserialize, Serialize};

/// Null slots the reaper tolerates across swept groups before it rebuilds a
/// group without them.
pub const COMPACTION_THRESHOLD: usize = 10_000;

/// Resource reaper policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Schedule sweeps at all.
    pub active: bool,
    /// A resource idle for longer than this is evicted.
    pub max_unused_ms: u64,
    /// Interval between resource and group sweeps.
    pub frequency_ms: u64,
    /// Interval between plain collection clean-ups.
    pub collection_frequency_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            active: true,
            max_unused_ms: 60_000,
            frequency_ms: 30_000,
            collection_frequency_ms: 60_000,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frequency_ms == 0 {
            return Err(ConfigError::ZeroFrequency {
                field: "frequency_ms",
            });
        }
        if self.collection_frequency_ms == 0 {
            return Err(ConfigError::ZeroFrequency {
                field: "collection_frequency_ms",
            });
        }
        Ok(())
    }
}

/// Layout of the per-frame uniform batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniformBatchConfig {
    /// Size in bytes of one placement slot. A single uniform group never
    /// spans more than one slot.
    pub min_alignment: usize,
    /// Offset granularity the device enforces on uniform bindings.
    pub granularity: usize,
    /// Initial arena size in floats.
    pub initial_capacity: usize,
}

impl Default for UniformBatchConfig {
    fn default() -> Self {
        Self {
            min_alignment: 128,
            granularity: 256,
            initial_capacity: 65_535,
        }
    }
}

impl UniformBatchConfig {
    /// Number of physical mirror buffers needed to serve every slot at a
    /// granularity-aligned offset.
    pub fn total_buffers(&self) -> usize {
        self.granularity / self.min_alignment
    }

    pub fn validate(&self) -> Result<(), UniformError> {
        if self.min_alignment == 0 || self.min_alignment % 4 != 0 {
            return Err(UniformError::InvalidAlignment {
                alignment: self.min_alignment,
            });
        }
        if self.granularity == 0 || self.granularity % self.min_alignment != 0 {
            return Err(UniformError::InvalidGranularity {
                granularity: self.granularity,
                alignment: self.min_alignment,
            });
        }
        if self.initial_capacity == 0 {
            return Err(UniformError::EmptyArena);
        }
        Ok(())
    }
}

/// Top-level settings for the render subsystems in this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub gc: GcConfig,
    pub uniform_batch: UniformBatchConfig,
}

impl RenderSettings {
    /// Parse and validate settings from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gc.validate()?;
        self.uniform_batch.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let gc = GcConfig::default();
        assert!(gc.active);
        assert_eq!(gc.max_unused_ms, 60_000);
        assert_eq!(gc.frequency_ms, 30_000);
        assert_eq!(COMPACTION_THRESHOLD, 10_000);

        let batch = UniformBatchConfig::default();
        assert_eq!(batch.min_alignment, 128);
        assert_eq!(batch.total_buffers(), 2);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings =
            RenderSettings::from_json_str(r#"{ "gc": { "max_unused_ms": 1000 } }"#).unwrap();
        assert_eq!(settings.gc.max_unused_ms, 1000);
        assert_eq!(settings.gc.frequency_ms, 30_000);
        assert_eq!(settings.uniform_batch, UniformBatchConfig::default());
    }

    #[test]
    fn empty_object_is_default() {
        let settings = RenderSettings::from_json_str("{}").unwrap();
        assert_eq!(settings, RenderSettings::default());
    }

    #[test]
    fn rejects_misaligned_slot_size() {
        let err = RenderSettings::from_json_str(r#"{ "uniform_batch": { "min_alignment": 6 } }"#)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Uniform(UniformError::InvalidAlignment { alignment: 6 })
        ));
    }

    #[test]
    fn rejects_granularity_not_multiple_of_alignment() {
        let config = UniformBatchConfig {
            min_alignment: 128,
            granularity: 192,
            initial_capacity: 16,
        };
        assert_eq!(
            config.validate(),
            Err(UniformError::InvalidGranularity {
                granularity: 192,
                alignment: 128,
            })
        );
    }

    #[test]
    fn rejects_zero_frequency() {
        let err = RenderSettings::from_json_str(r#"{ "gc": { "frequency_ms": 0 } }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ZeroFrequency {
                field: "frequency_ms"
            }
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = RenderSettings::from_json_str("{ gc: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
