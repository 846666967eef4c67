//! Session configuration
//!
//! Every section has defaults, so a partial JSON file only needs the keys it
//! changes. Validation runs once at startup and is the only fatal error path.

use std::path::Path;

use serde::{Deserialize, Serialize};
use skylink_core::{QualityTable, SkylinkError, SkylinkResult};
use skylink_transport::{ChannelConfig, LinkConfig};

/// Longest keyframe refresh accepted, in seconds
pub const MAX_KEYFRAME_REFRESH_SECS: f64 = 3600.0;

/// Adaptive controller tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub min_fps: f64,
    pub max_fps: f64,
    pub initial_fps: f64,
    /// Link bandwidth mapped to the bottom of the fps range (bps)
    pub min_bandwidth_bps: f64,
    /// Link bandwidth mapped to the top of the fps range (bps)
    pub max_bandwidth_bps: f64,
    /// Motion intensity that counts as full motion
    pub motion_threshold: f64,
    /// Weight of the previous fps in smoothing
    pub fps_smoothing: f64,
    /// Enter emergency below this link quality
    pub emergency_quality: f64,
    /// Enter emergency below this bandwidth (bps)
    pub emergency_bandwidth_bps: f64,
    /// Leave emergency above this link quality
    pub recovery_quality: f64,
    /// Keyframe refresh in normal mode
    pub keyframe_refresh_secs: f64,
    /// Keyframe refresh in emergency mode
    pub emergency_keyframe_refresh_secs: f64,
    /// Floor for the motion-adjusted keyframe interval, in frames
    pub min_keyframe_interval: u32,
    /// Share of the link given to the keypoint stream when mapping
    /// bandwidth to a codec budget
    pub telemetry_share: f64,
    /// Send-queue backlog, in seconds at the estimated rate, that counts
    /// as congestion
    pub max_backlog_secs: f64,
    /// Congestion-free time before one backoff step is undone
    pub backoff_recovery_secs: f64,
    /// Fixed codec budget in kbps, bypassing the link estimate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_override: Option<f64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            min_fps: 5.0,
            max_fps: 15.0,
            initial_fps: 10.0,
            min_bandwidth_bps: 2000.0,
            max_bandwidth_bps: 4000.0,
            motion_threshold: 0.1,
            fps_smoothing: 0.7,
            emergency_quality: 0.3,
            emergency_bandwidth_bps: 1500.0,
            recovery_quality: 0.5,
            keyframe_refresh_secs: 2.0,
            emergency_keyframe_refresh_secs: 3.0,
            min_keyframe_interval: 10,
            telemetry_share: 0.1,
            max_backlog_secs: 0.5,
            backoff_recovery_secs: 5.0,
            budget_override: None,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> SkylinkResult<()> {
        if !(self.min_fps > 0.0 && self.min_fps <= self.max_fps) {
            return Err(invalid(format!(
                "fps range [{}, {}] is empty or not positive",
                self.min_fps, self.max_fps
            )));
        }
        if !(self.min_fps..=self.max_fps).contains(&self.initial_fps) {
            return Err(invalid(format!(
                "initial fps {} outside [{}, {}]",
                self.initial_fps, self.min_fps, self.max_fps
            )));
        }
        if !(self.min_bandwidth_bps < self.max_bandwidth_bps) {
            return Err(invalid("min bandwidth must be below max bandwidth".into()));
        }
        if !(self.motion_threshold > 0.0) {
            return Err(invalid("motion threshold must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.fps_smoothing) {
            return Err(invalid("fps smoothing must be in [0, 1)".into()));
        }
        if self.recovery_quality < self.emergency_quality {
            return Err(invalid(
                "recovery quality must not be below the emergency threshold".into(),
            ));
        }
        for (name, secs) in [
            ("keyframe refresh", self.keyframe_refresh_secs),
            ("emergency keyframe refresh", self.emergency_keyframe_refresh_secs),
        ] {
            if !(secs > 0.0 && secs <= MAX_KEYFRAME_REFRESH_SECS) {
                return Err(invalid(format!(
                    "{} of {} s outside (0, {}]",
                    name, secs, MAX_KEYFRAME_REFRESH_SECS
                )));
            }
        }
        if self.min_keyframe_interval == 0 {
            return Err(invalid("minimum keyframe interval is zero".into()));
        }
        if !(self.telemetry_share > 0.0 && self.telemetry_share <= 1.0) {
            return Err(invalid("telemetry share must be in (0, 1]".into()));
        }
        if !(self.max_backlog_secs > 0.0 && self.max_backlog_secs <= MAX_KEYFRAME_REFRESH_SECS) {
            return Err(invalid(format!(
                "backlog limit of {} s is not usable",
                self.max_backlog_secs
            )));
        }
        if !(self.backoff_recovery_secs >= 0.0
            && self.backoff_recovery_secs <= MAX_KEYFRAME_REFRESH_SECS)
        {
            return Err(invalid(format!(
                "backoff recovery of {} s is not usable",
                self.backoff_recovery_secs
            )));
        }
        if let Some(budget) = self.budget_override {
            if !(budget.is_finite() && budget >= 0.0) {
                return Err(invalid(format!("budget override {} is not usable", budget)));
            }
        }
        Ok(())
    }
}

/// Everything a telemetry session needs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkylinkConfig {
    pub quality: QualityTable,
    pub controller: ControllerConfig,
    pub link: LinkConfig,
    pub channel: ChannelConfig,
}

impl SkylinkConfig {
    /// Parse and validate JSON
    pub fn from_json_str(json: &str) -> SkylinkResult<Self> {
        let config: SkylinkConfig = serde_json::from_str(json)
            .map_err(|e| invalid(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> SkylinkResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> SkylinkResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| invalid(format!("config serialize error: {}", e)))
    }

    pub fn validate(&self) -> SkylinkResult<()> {
        self.quality.validate()?;
        self.controller.validate()?;
        self.link.validate()?;
        self.channel.validate()?;
        Ok(())
    }
}

fn invalid(msg: String) -> SkylinkError {
    SkylinkError::InvalidConfig(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_core::QualityName;

    #[test]
    fn test_defaults_validate() {
        assert!(SkylinkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = SkylinkConfig::from_json_str(
            r#"{ "controller": { "max_fps": 12.0 }, "channel": { "loss_rate": 0.2 } }"#,
        )
        .unwrap();
        assert_eq!(config.controller.max_fps, 12.0);
        assert_eq!(config.controller.min_fps, 5.0);
        assert_eq!(config.channel.loss_rate, 0.2);
        assert_eq!(config.channel.base_latency_ms, 300);
        assert_eq!(config.quality.levels.len(), 4);
    }

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(
            SkylinkConfig::from_json_str("{}").unwrap(),
            SkylinkConfig::default()
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = SkylinkConfig::default();
        config.controller.budget_override = Some(0.3);
        let json = config.to_json_pretty().unwrap();
        assert_eq!(SkylinkConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_fps_range() {
        let result = SkylinkConfig::from_json_str(r#"{ "controller": { "min_fps": 20.0 } }"#);
        assert!(matches!(result, Err(SkylinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_monotonic_quality_table() {
        let mut config = SkylinkConfig::default();
        config.quality.levels[3].keyframe_interval = 90;
        assert!(config.validate().is_err());
        assert_eq!(config.quality.levels[3].name, QualityName::High);
    }

    #[test]
    fn test_rejects_bandwidth_bounds() {
        let mut config = SkylinkConfig::default();
        config.controller.min_bandwidth_bps = 5000.0;
        assert!(config.validate().is_err());

        let mut config = SkylinkConfig::default();
        config.link.bandwidth_floor_bps = 5000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keyframe_refresh_bounds() {
        let mut config = SkylinkConfig::default();
        config.controller.keyframe_refresh_secs = MAX_KEYFRAME_REFRESH_SECS;
        assert!(config.validate().is_ok());

        for secs in [0.0, -1.0, 1e300, f64::INFINITY, f64::NAN] {
            let mut config = SkylinkConfig::default();
            config.controller.keyframe_refresh_secs = secs;
            assert!(config.validate().is_err(), "{}", secs);

            let mut config = SkylinkConfig::default();
            config.controller.emergency_keyframe_refresh_secs = secs;
            assert!(config.validate().is_err(), "{}", secs);
        }

        let result = SkylinkConfig::from_json_str(
            r#"{ "controller": { "keyframe_refresh_secs": 1e300 } }"#,
        );
        assert!(matches!(result, Err(SkylinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unusable_backoff() {
        let mut config = SkylinkConfig::default();
        config.controller.max_backlog_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = SkylinkConfig::default();
        config.controller.backoff_recovery_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_channel_delay_overflow() {
        let result = SkylinkConfig::from_json_str(
            r#"{ "channel": { "base_latency_ms": 18446744073709551615 } }"#,
        );
        assert!(matches!(result, Err(SkylinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_tick() {
        let mut config = SkylinkConfig::default();
        config.link.monitor_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SkylinkConfig::from_json_str("{ not json"),
            Err(SkylinkError::InvalidConfig(_))
        ));
    }
}
