pub mod clock;
pub mod endpoint;
pub mod error;
pub mod feeder;
pub mod frame;
pub mod host;
pub mod relay;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use clock::HostTime;
pub use error::{RelayError, Result};
pub use frame::{FormatDescription, Frame, FramePool, PixelFormat, PoolStats};
pub use relay::{DeviceEvent, DeviceInfo, EventSubscription, RelayDevice};

use endpoint::StreamFormat;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub pool: PoolConfig,
    pub sink: SinkConfig,
}

/// Identity and stream format of the virtual device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub manufacturer: String,
    pub name: String,
    pub model: String,
    pub device_id: Uuid,
    pub source_name: String,
    pub source_id: Uuid,
    pub sink_name: String,
    pub sink_id: Uuid,
    pub frame_rate: u32,
    pub frame_rate_scale: ScaleRange,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Acceptable playback-rate multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleRange {
    pub min: f32,
    pub max: f32,
}

impl ScaleRange {
    pub fn contains(&self, rate: f32) -> bool {
        self.min <= rate && rate <= self.max
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
}

/// Values the sink reports to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub queue_size: usize,
    pub buffers_required_for_startup: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            manufacturer: "Relaycam".into(),
            name: "Relay Camera".into(),
            model: "Relay Camera Model A".into(),
            device_id: Uuid::from_u128(0x5d1c_7a3e_0b2f_4c8e_9a61_3f0d_2e4b_7c10),
            source_name: "Relay Camera Source".into(),
            source_id: Uuid::from_u128(0x5d1c_7a3e_0b2f_4c8e_9a61_3f0d_2e4b_7c11),
            sink_name: "Relay Camera Sink".into(),
            sink_id: Uuid::from_u128(0x5d1c_7a3e_0b2f_4c8e_9a61_3f0d_2e4b_7c12),
            frame_rate: 30,
            frame_rate_scale: ScaleRange { min: 0.5, max: 2.0 },
            width: 1920,
            height: 1080,
            format: PixelFormat::Bgra32,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 3 }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_size: 1,
            buffers_required_for_startup: 1,
        }
    }
}

impl DeviceConfig {
    /// Longest a frame may stay on screen: one frame period
    pub fn max_frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    pub fn min_frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    /// One frame period scaled by a playback rate
    pub fn frame_delay(&self, rate: f64) -> Duration {
        self.max_frame_duration().mul_f64(rate.max(0.0))
    }

    pub fn format_description(&self) -> Result<FormatDescription> {
        FormatDescription::new(self.width, self.height, self.format)
    }

    pub fn stream_format(&self) -> Result<StreamFormat> {
        Ok(StreamFormat {
            description: self.format_description()?,
            max_frame_duration: self.max_frame_duration(),
            min_frame_duration: self.min_frame_duration(),
        })
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `RELAYCAM__SECTION__KEY` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAYCAM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no device could be built from.
    pub fn validate(&self) -> Result<()> {
        let device = &self.device;
        if device.frame_rate == 0 {
            return Err(RelayError::invalid_config("frame_rate must be > 0"));
        }
        let scale = device.frame_rate_scale;
        if !(scale.min > 0.0 && scale.min <= scale.max && scale.contains(1.0)) {
            return Err(RelayError::invalid_config(format!(
                "frame_rate_scale {}..{} must be positive and contain 1.0",
                scale.min, scale.max
            )));
        }
        device
            .format_description()
            .map_err(|e| RelayError::invalid_config(e.to_string()))?;
        if self.pool.capacity == 0 {
            return Err(RelayError::invalid_config("pool.capacity must be > 0"));
        }
        if self.sink.queue_size == 0 {
            return Err(RelayError::invalid_config("sink.queue_size must be > 0"));
        }
        Ok(())
    }
}

/// Relay counters collected by the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Non-empty samples pulled from the producer
    pub frames_received: u64,
    pub frames_delivered: u64,
    /// Accepted while no viewer was active
    pub frames_unviewed: u64,
    pub pool_exhausted: u64,
    pub format_failures: u64,
    pub frames_acknowledged: u64,
    pub pool: PoolStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// `Config::load` reads the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.device.max_frame_duration(), Duration::from_secs(1) / 30);
        assert_eq!(config.device.frame_delay(2.0), Duration::from_secs(2) / 30);
        assert_eq!(config.pool.capacity, 3);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.device.frame_rate = 0;
        assert!(matches!(config.validate(), Err(RelayError::InvalidConfiguration(_))));

        let mut config = Config::default();
        config.device.width = 0;
        assert!(matches!(config.validate(), Err(RelayError::InvalidConfiguration(_))));

        let mut config = Config::default();
        config.device.frame_rate_scale = ScaleRange { min: 1.5, max: 2.0 };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = std::env::temp_dir().join(format!("relaycam-{}.toml", Uuid::new_v4()));
        std::fs::write(
            &path,
            "[device]\nframe_rate = 60\nwidth = 1280\nheight = 720\n\n[pool]\ncapacity = 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.device.frame_rate, 60);
        assert_eq!(config.device.width, 1280);
        assert_eq!(config.pool.capacity, 5);
        // Untouched fields keep their defaults
        assert_eq!(config.device.format, PixelFormat::Bgra32);
        assert_eq!(config.sink.queue_size, 1);
    }

    #[test]
    fn test_env_overrides_file_and_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = std::env::temp_dir().join(format!("relaycam-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "[pool]\ncapacity = 5\n").unwrap();

        std::env::set_var("RELAYCAM__POOL__CAPACITY", "7");
        std::env::set_var("RELAYCAM__DEVICE__FRAME_RATE", "24");
        let from_file = Config::load(Some(&path));
        let without_file = Config::load(None);
        std::env::remove_var("RELAYCAM__POOL__CAPACITY");
        std::env::remove_var("RELAYCAM__DEVICE__FRAME_RATE");
        std::fs::remove_file(&path).ok();

        let from_file = from_file.unwrap();
        assert_eq!(from_file.pool.capacity, 7);
        assert_eq!(from_file.device.frame_rate, 24);

        let without_file = without_file.unwrap();
        assert_eq!(without_file.pool.capacity, 7);
        assert_eq!(without_file.device.width, 1920);
    }

    #[test]
    fn test_global_config_swap() {
        let mut config = Config::default();
        config.device.frame_rate = 25;
        CONFIG.store(std::sync::Arc::new(config));
        assert_eq!(CONFIG.load().device.frame_rate, 25);
        CONFIG.store(std::sync::Arc::new(Config::default()));
    }
}
