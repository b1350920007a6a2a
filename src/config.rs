//! Encoder tuning knobs, loadable from TOML.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one virtual encoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Delay after the last frame completion before releasing clocks (ms)
    pub idle_timeout_ms: u64,
    /// Whether idle power collapse is allowed at all
    pub idle_pc_supported: bool,
    /// Frame-done watchdog length, in frames of the current refresh rate
    pub frame_done_timeout_frames: u32,
    /// Bound on every blocking interrupt wait (ms)
    pub irq_wait_timeout_ms: u64,
    /// Read the raw interrupt status once when a wait times out, and treat a
    /// latched status as a completed (coalesced) interrupt
    pub coalesced_irq_fallback: bool,
    /// Consecutive ping-pong timeouts before a panel is reported dead
    pub pp_timeout_max_trials: u32,
    /// Arm the early vsync wakeup after kickoff on DSI interfaces
    pub early_wakeup: bool,
    /// Idle delay after an early wakeup brought resources back from Idle (ms)
    pub early_wakeup_idle_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 58,
            idle_pc_supported: true,
            frame_done_timeout_frames: 60,
            irq_wait_timeout_ms: 84, // five frames at 60 Hz
            coalesced_irq_fallback: true,
            pp_timeout_max_trials: 4,
            early_wakeup: true,
            early_wakeup_idle_timeout_ms: 192,
        }
    }
}

impl EncoderConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EncoderConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded encoder config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_done_timeout_frames == 0 {
            return Err(ConfigError::Invalid(
                "frame_done_timeout_frames must be at least 1".into(),
            ));
        }
        if self.irq_wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "irq_wait_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn early_wakeup_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.early_wakeup_idle_timeout_ms)
    }

    pub fn irq_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.irq_wait_timeout_ms)
    }

    /// Watchdog length for a panel refreshing at `vrefresh` Hz.
    pub fn frame_done_timeout(&self, vrefresh: u32) -> Duration {
        let vrefresh = if vrefresh == 0 { 60 } else { vrefresh };
        Duration::from_millis(u64::from(self.frame_done_timeout_frames) * 1000 / u64::from(vrefresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EncoderConfig::from_toml_str("idle_timeout_ms = 10\n").unwrap();
        assert_eq!(config.idle_timeout_ms, 10);
        assert_eq!(config.frame_done_timeout_frames, 60);
        assert!(config.coalesced_irq_fallback);
        assert_eq!(config.early_wakeup_idle_timeout(), Duration::from_millis(192));
    }

    #[test]
    fn rejects_zero_watchdog() {
        let err = EncoderConfig::from_toml_str("frame_done_timeout_frames = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "idle_pc_supported = false").unwrap();
        writeln!(file, "irq_wait_timeout_ms = 20").unwrap();

        let config = EncoderConfig::load(file.path()).unwrap();
        assert!(!config.idle_pc_supported);
        assert_eq!(config.irq_wait_timeout(), Duration::from_millis(20));
    }

    #[test]
    fn watchdog_scales_with_refresh() {
        let config = EncoderConfig::default();
        assert_eq!(config.frame_done_timeout(60), Duration::from_millis(1000));
        assert_eq!(config.frame_done_timeout(120), Duration::from_millis(500));
        // No mode yet: assume 60 Hz
        assert_eq!(config.frame_done_timeout(0), Duration::from_millis(1000));
    }
}
