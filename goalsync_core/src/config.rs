//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GoalError;
use crate::interpolation::BlendMode;

/// Configuration for a GoalSync client.
///
/// Every field has a default, so a config file only names what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client's logical name (for logging)
    pub name: String,

    /// Frame rate in Hz (default: 60)
    pub tick_rate_hz: u32,

    /// Blend mode of the built-in animators
    pub blend: BlendMode,

    /// Distance under which a vector goal counts as reached (default: 0.01)
    pub position_threshold: f64,

    /// Difference under which a scalar goal counts as reached (default: 0.001)
    pub scalar_threshold: f64,

    /// How far ahead of now local updates set `due`, in ms (default: 100)
    pub due_lead_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "goalsync-client".to_string(),
            tick_rate_hz: 60,
            blend: BlendMode::FixedRate { rate: 0.2 },
            position_threshold: 0.01,
            scalar_threshold: 0.001,
            due_lead_ms: 100,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, GoalError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GoalError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GoalError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GoalError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Seconds per frame.
    pub fn frame_secs(&self) -> f64 {
        1.0 / self.tick_rate_hz as f64
    }

    fn validate(&self) -> Result<(), GoalError> {
        if self.tick_rate_hz == 0 {
            return Err(GoalError::Config("tick_rate_hz must be positive".into()));
        }
        if self.position_threshold < 0.0 || self.scalar_threshold < 0.0 {
            return Err(GoalError::Config("thresholds must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.tick_rate_hz, 60);
        assert_eq!(config.blend, BlendMode::FixedRate { rate: 0.2 });
        assert_eq!(config.due_lead_ms, 100);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{"tick_rate_hz": 30, "blend": {"mode": "distance_proportional", "speed": 4.0}}"#,
        )
        .unwrap();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.blend, BlendMode::DistanceProportional { speed: 4.0 });
        assert_eq!(config.position_threshold, 0.01);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"tick_rate_hz": 0}"#),
            Err(GoalError::Config(_))
        ));
        assert!(ClientConfig::from_json_str("not json").is_err());
        assert!(ClientConfig::load("/nonexistent/goalsync.json").is_err());
    }
}
