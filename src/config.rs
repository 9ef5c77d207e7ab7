use crate::capture::CaptureTimeouts;
use crate::hardware::SimulatorBehavior;
use crate::params::{CaptureParameters, OperatingMode};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StillcapConfig {
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub capture: CaptureParameters,
    #[serde(default)]
    pub simulator: SimulatorBehavior,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AdapterConfig {
    /// Number of capture buffers registered with the image port
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Bytes allocated per capture buffer
    #[serde(default = "default_buffer_size_hint")]
    pub buffer_size_hint: usize,

    /// Camera operating mode (high_quality, high_quality_zsl, high_speed, video)
    #[serde(default = "default_operating_mode")]
    pub operating_mode: OperatingMode,

    /// Port enable/disable completion timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Shutter and capture-complete timeout in milliseconds
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Capture event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl AdapterConfig {
    pub fn timeouts(&self) -> CaptureTimeouts {
        CaptureTimeouts {
            command: Duration::from_millis(self.command_timeout_ms),
            capture: Duration::from_millis(self.capture_timeout_ms),
        }
    }
}

impl StillcapConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("stillcap.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("adapter.buffer_count", default_buffer_count() as i64)?
            .set_default("adapter.buffer_size_hint", default_buffer_size_hint() as i64)?
            .set_default("adapter.operating_mode", "high_quality")?
            .set_default("adapter.command_timeout_ms", default_command_timeout_ms())?
            .set_default("adapter.capture_timeout_ms", default_capture_timeout_ms())?
            .set_default(
                "adapter.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            // STILLCAP_ADAPTER__BUFFER_COUNT=6
            .add_source(
                Environment::with_prefix("STILLCAP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: StillcapConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adapter.buffer_count == 0 {
            return Err(ConfigError::Message(
                "Buffer count must be greater than 0".to_string(),
            ));
        }

        if self.adapter.buffer_size_hint == 0 {
            return Err(ConfigError::Message(
                "Buffer size hint must be greater than 0".to_string(),
            ));
        }

        if self.adapter.command_timeout_ms == 0 || self.adapter.capture_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Timeouts must be greater than 0".to_string(),
            ));
        }

        if self.adapter.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        if let Some((width, height)) = self.capture.picture_size {
            if width == 0 || height == 0 {
                return Err(ConfigError::Message(
                    "Picture size must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for StillcapConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig {
                buffer_count: default_buffer_count(),
                buffer_size_hint: default_buffer_size_hint(),
                operating_mode: default_operating_mode(),
                command_timeout_ms: default_command_timeout_ms(),
                capture_timeout_ms: default_capture_timeout_ms(),
                event_bus_capacity: default_event_bus_capacity(),
            },
            capture: CaptureParameters {
                picture_size: Some((640, 480)),
                picture_format: Some("jpeg".to_string()),
                burst: Some(3),
                jpeg_quality: Some(95),
                ..Default::default()
            },
            simulator: SimulatorBehavior::default(),
        }
    }
}

fn default_buffer_count() -> usize {
    4
}
fn default_buffer_size_hint() -> usize {
    640 * 480 * 2
}
fn default_operating_mode() -> OperatingMode {
    OperatingMode::HighQuality
}
fn default_command_timeout_ms() -> u64 {
    3000
}
fn default_capture_timeout_ms() -> u64 {
    5000
}
fn default_event_bus_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = StillcapConfig::default();
        assert!(config.validate().is_ok());

        let timeouts = config.adapter.timeouts();
        assert_eq!(timeouts.command, Duration::from_secs(3));
        assert_eq!(timeouts.capture, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StillcapConfig::load_from_file(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.adapter.buffer_count, 4);
        assert_eq!(config.adapter.operating_mode, OperatingMode::HighQuality);
        assert_eq!(config.capture, CaptureParameters::default());
        assert!(config.simulator.ack_port_disable);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[adapter]
buffer_count = 2
operating_mode = "video"
capture_timeout_ms = 250

[capture]
picture_size = [320, 240]
picture_format = "yuv420sp"
burst = 5
exposure_bracketing_range = "-20,0,20"

[simulator]
fire_shutter = false
"#
        )
        .unwrap();

        let config = StillcapConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.adapter.buffer_count, 2);
        assert_eq!(config.adapter.operating_mode, OperatingMode::Video);
        assert_eq!(config.adapter.capture_timeout_ms, 250);
        assert_eq!(config.adapter.command_timeout_ms, 3000);
        assert_eq!(config.capture.picture_size, Some((320, 240)));
        assert_eq!(config.capture.burst, Some(5));
        assert_eq!(
            config.capture.exposure_bracketing_range.as_deref(),
            Some("-20,0,20")
        );
        assert!(!config.simulator.fire_shutter);
        assert!(config.simulator.auto_complete);
    }

    #[test]
    fn test_config_validation() {
        let mut config = StillcapConfig::default();
        config.adapter.buffer_count = 0;
        assert!(config.validate().is_err());

        config.adapter.buffer_count = 1;
        config.capture.picture_size = Some((0, 480));
        assert!(config.validate().is_err());

        config.capture.picture_size = Some((640, 480));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&StillcapConfig::default()).unwrap();
        let parsed: StillcapConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.adapter.buffer_count, 4);
        assert_eq!(parsed.capture.burst, Some(3));
    }
}
