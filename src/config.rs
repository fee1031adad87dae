//! Configuration.
//!
//! The configuration is read once at startup. Every field has a default, and
//! an optional JSON file can override any subset of them, for instance
//!
//! ```json
//! { "recording": { "sample_rate": 20000 }, "dma": { "max_sync_polls": 100000 } }
//! ```

use crate::dma::{DeviceAddresses, DEFAULT_MAX_SYNC_POLLS};
use crate::error::{Error, Result};
use crate::filter::{LeakyIntegrator, NlmsParameters, NoiseCanceller, StepMode};
use anyhow::Context;
use chrono::{DateTime, TimeZone};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Physical addresses of the AXI DMA.
    pub device: DeviceAddresses,
    /// DMA driver settings.
    pub dma: DmaConfig,
    /// Continuous recording (`record` command).
    pub recording: RecordingConfig,
    /// Data collection (`collect` command).
    #[serde(deserialize_with = "collection_section")]
    pub collection: RecordingConfig,
    /// Noise cancellation filter.
    pub filter: FilterConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            device: DeviceAddresses::default(),
            dma: DmaConfig::default(),
            recording: RecordingConfig::default(),
            collection: RecordingConfig::collection(),
            filter: FilterConfig::default(),
        }
    }
}

/// Deserializes the collection section on top of the collection defaults
/// rather than the recording defaults.
fn collection_section<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<RecordingConfig, D::Error> {
    let overrides = serde_json::Value::deserialize(deserializer)?;
    let mut section =
        serde_json::to_value(RecordingConfig::collection()).map_err(D::Error::custom)?;
    match (&mut section, overrides) {
        (serde_json::Value::Object(section), serde_json::Value::Object(overrides)) => {
            section.extend(overrides)
        }
        (_, other) => {
            return Err(D::Error::custom(format!(
                "expected a collection section object, found {other}"
            )))
        }
    }
    serde_json::from_value(section).map_err(D::Error::custom)
}

/// DMA driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DmaConfig {
    /// Maximum number of status polls while waiting for a transfer.
    pub max_sync_polls: u64,
}

impl Default for DmaConfig {
    fn default() -> DmaConfig {
        DmaConfig {
            max_sync_polls: DEFAULT_MAX_SYNC_POLLS,
        }
    }
}

/// How the received words are distributed to the recorded channels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Round-robin over the channels.
    Interleaved,
    /// A single channel.
    Raw,
    /// `(optical, reference)` pairs through the noise canceller.
    Cancellation,
}

/// Recording settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    /// Base name of the segment files. A timestamp is appended to it.
    pub name: String,
    /// Number of input channels.
    pub channels: u32,
    /// Bit depth of the samples.
    pub bits_per_sample: u16,
    /// Sample rate in samples per second.
    pub sample_rate: u32,
    /// Record the intermediate signals of the noise canceller too.
    pub record_all: bool,
    /// Seconds of signal per save interval.
    pub save_interval_secs: u32,
    /// Seconds of signal by which the channel buffers grow.
    pub buffer_secs: u32,
    /// Memory available for one segment, in bytes.
    pub memory_budget: u64,
    /// Bytes per stored sample.
    pub bytes_per_sample: u32,
    /// Capture mode.
    pub mode: CaptureMode,
}

impl Default for RecordingConfig {
    fn default() -> RecordingConfig {
        RecordingConfig {
            name: "optrode_record".to_string(),
            channels: 1,
            bits_per_sample: 24,
            sample_rate: 10_000,
            record_all: true,
            save_interval_secs: 1,
            buffer_secs: 1,
            memory_budget: 32 * 1024 * 1024,
            bytes_per_sample: 4,
            mode: CaptureMode::Cancellation,
        }
    }
}

impl RecordingConfig {
    /// Default data collection settings.
    pub fn collection() -> RecordingConfig {
        RecordingConfig {
            name: "data_coll".to_string(),
            channels: 4,
            bits_per_sample: 24,
            sample_rate: 64_000,
            record_all: false,
            buffer_secs: 30,
            mode: CaptureMode::Interleaved,
            ..Default::default()
        }
    }

    /// Number of channels written to the segment files.
    pub fn recorded_channels(&self) -> u32 {
        if self.record_all {
            self.channels.saturating_mul(4)
        } else {
            self.channels
        }
    }

    /// Computes the recording sizes.
    ///
    /// Fails if the memory budget cannot hold a single save interval, or if
    /// the channel layout does not suit the capture mode.
    pub fn sizes(&self) -> Result<RecordingSizes> {
        if self.channels == 0 || self.sample_rate == 0 || self.save_interval_secs == 0 {
            return Err(Error::Config(format!(
                "{}: channels, sample rate and save interval must be positive",
                self.name
            )));
        }
        if !(1..=32).contains(&self.bits_per_sample) {
            return Err(Error::Config(format!(
                "{}: unsupported bit depth {}",
                self.name, self.bits_per_sample
            )));
        }
        match self.mode {
            CaptureMode::Raw if self.recorded_channels() != 1 => {
                return Err(Error::Config(format!(
                    "{}: raw capture records a single channel",
                    self.name
                )))
            }
            CaptureMode::Cancellation if self.channels != 1 => {
                return Err(Error::Config(format!(
                    "{}: noise cancellation takes one optical and reference pair",
                    self.name
                )))
            }
            _ => (),
        }
        let product = |factors: &[u64]| {
            factors
                .iter()
                .try_fold(1u64, |acc, &x| acc.checked_mul(x))
                .ok_or_else(|| {
                    Error::Config(format!("{}: recording sizes overflow", self.name))
                })
        };
        let memory_per_second = product(&[
            self.bytes_per_sample.into(),
            3,
            self.channels.into(),
            self.sample_rate.into(),
        ])?;
        let segment_memory = product(&[memory_per_second, self.save_interval_secs.into()])?;
        let file_interval = self.memory_budget / segment_memory.max(1);
        if file_interval == 0 {
            return Err(Error::Config(format!(
                "{}: insufficient memory for recording ({} bytes needed per save interval, {} available)",
                self.name, segment_memory, self.memory_budget
            )));
        }
        let recorded_channels = self.recorded_channels();
        let samples_per_file = product(&[
            recorded_channels.into(),
            self.sample_rate.into(),
            self.save_interval_secs.into(),
            file_interval,
        ])?;
        let buffer_increment = product(&[self.sample_rate.into(), self.buffer_secs.into()])?;
        if buffer_increment == 0 {
            return Err(Error::Config(format!(
                "{}: buffer growth must be positive",
                self.name
            )));
        }
        let to_usize = |x: u64| {
            usize::try_from(x).map_err(|_| Error::Config(format!("{}: {x} is too large", self.name)))
        };
        Ok(RecordingSizes {
            memory_per_second,
            segment_memory,
            file_interval,
            recorded_channels: to_usize(recorded_channels.into())?,
            samples_per_file: to_usize(samples_per_file)?,
            buffer_increment: to_usize(buffer_increment)?,
        })
    }
}

/// Sizes derived from a [`RecordingConfig`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RecordingSizes {
    /// Bytes of memory per second of recording.
    pub memory_per_second: u64,
    /// Bytes of memory per save interval.
    pub segment_memory: u64,
    /// Save intervals per segment file.
    pub file_interval: u64,
    /// Channels written to the segment files.
    pub recorded_channels: usize,
    /// Rotation threshold of the segment files, in samples.
    pub samples_per_file: usize,
    /// Channel buffer growth, in samples.
    pub buffer_increment: usize,
}

/// Noise cancellation filter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Number of taps of the adaptive filter.
    pub taps: usize,
    /// Initial step size.
    pub initial_step: f32,
    /// Minimum step size. Defaults to a tenth of the initial step size.
    pub min_step: Option<f32>,
    /// Maximum step size. Defaults to ten times the initial step size.
    pub max_step: Option<f32>,
    /// Step size forgetting factor.
    pub alpha: f32,
    /// Step size error gain.
    pub gamma: f32,
    /// Regularization of the input power.
    pub epsilon: f32,
    /// Normalize the tap updates by the input power.
    pub normalized: bool,
    /// Adapt the step size.
    pub variable_step: bool,
    /// Weight of the previous output of the DC trackers.
    pub leaky_alpha: f32,
    /// Weight of the input of the DC trackers.
    pub leaky_complement: f32,
}

impl Default for FilterConfig {
    fn default() -> FilterConfig {
        FilterConfig {
            taps: 1,
            initial_step: 1e-6,
            min_step: None,
            max_step: None,
            alpha: 0.5,
            gamma: 0.5,
            epsilon: 1e-6,
            normalized: true,
            variable_step: true,
            leaky_alpha: 0.99,
            leaky_complement: 0.01,
        }
    }
}

impl FilterConfig {
    /// Adaptive filter parameters.
    pub fn nlms(&self) -> NlmsParameters<f32> {
        NlmsParameters {
            initial_step: self.initial_step,
            min_step: self.min_step.unwrap_or(self.initial_step / 10.0),
            max_step: self.max_step.unwrap_or(self.initial_step * 10.0),
            epsilon: self.epsilon,
            mode: if self.variable_step {
                StepMode::Variable {
                    alpha: self.alpha,
                    gamma: self.gamma,
                }
            } else {
                StepMode::Fixed
            },
            normalized: self.normalized,
        }
    }

    /// DC tracker template.
    pub fn leaky(&self) -> LeakyIntegrator<f32> {
        LeakyIntegrator::new(self.leaky_alpha, self.leaky_complement, 0.0)
    }

    /// Builds a noise canceller.
    pub fn canceller(&self) -> NoiseCanceller<f32> {
        NoiseCanceller::new(self.taps, self.nlms(), self.leaky())
    }

    fn validate(&self) -> Result<()> {
        let params = self.nlms();
        if self.taps == 0 {
            return Err(Error::Config("the adaptive filter needs at least one tap".into()));
        }
        // written so that NaN bounds are rejected too
        if !(params.min_step <= params.max_step) {
            return Err(Error::Config(format!(
                "invalid step size bounds [{}, {}]",
                params.min_step, params.max_step
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// Without a file the defaults are used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let config = match path {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read configuration {}", path.display()))?;
                Config::from_json(&json)
                    .with_context(|| format!("failed to load configuration {}", path.display()))?
            }
            None => Config::default(),
        };
        tracing::debug!("configuration: {config:?}");
        Ok(config)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        self.recording.sizes()?;
        self.collection.sizes()?;
        self.filter.validate()?;
        if self.dma.max_sync_polls == 0 {
            return Err(Error::Config("max_sync_polls must be positive".into()));
        }
        Ok(())
    }
}

/// Appends a `%Y-%m-%d_%H-%M-%S` timestamp to a base name.
pub fn timestamped<Tz: TimeZone>(name: &str, time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{name}_{}", time.format("%Y-%m-%d_%H-%M-%S"))
}
