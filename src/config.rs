//! Model hyper-parameters and the JSON5 run configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::Error as DeserializeError, ser::Error as SerializeError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tch::Device;

use crate::error::{Error, Result};

/// Spatial resolution of every frame entering or leaving the networks.
pub const FRAME_SIZE: i64 = 96;

/// Spatial extent left after four stride-2 reductions of [`FRAME_SIZE`].
pub const TERMINAL_SIZE: i64 = 6;

/// Frames consumed by the four stride-2 steps of the clip discriminator.
pub const MIN_TIME_STEPS: i64 = 16;

/// Divisor fixing the generator's label-embedding width.
pub const GENERATOR_EMBEDDING_RATIO: i64 = 16;

/// Negative slope of every leaky rectifier in the discriminators.
pub const LEAKY_SLOPE: f64 = 0.2;

/// Architecture parameters shared by the generator, both discriminators and
/// the frame sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Colour channels per frame.
    pub nc: i64,
    /// Base discriminator feature width.
    pub ndf: i64,
    /// Base generator feature width.
    pub ngf: i64,
    /// Latent width.
    pub nz: i64,
    /// Label vocabulary size, including the reserved fake class.
    pub num_classes: i64,
    /// Frames per clip.
    pub time_steps: i64,
    /// Reserved label meaning "generated".
    pub fake_label: i64,
    pub sequencer_hidden: i64,
    pub dropout: f64,
    pub forget_bias: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // 101 action classes; the 1-based class index file leaves 0 free for the fake class.
        Self {
            nc: 3,
            ndf: 64,
            ngf: 64,
            nz: 60,
            num_classes: 102,
            time_steps: 16,
            fake_label: 0,
            sequencer_hidden: 100,
            dropout: 0.0,
            forget_bias: 1.0,
        }
    }
}

impl ModelConfig {
    pub fn generator_embedding_dim(&self) -> i64 {
        self.num_classes / GENERATOR_EMBEDDING_RATIO
    }

    pub fn discriminator_embedding_dim(&self) -> i64 {
        self.num_classes / self.time_steps
    }

    /// Flattened width of the clip discriminator's convolutional trunk.
    pub fn clip_feature_dim(&self) -> i64 {
        self.ndf * 8 * (self.time_steps / MIN_TIME_STEPS) * TERMINAL_SIZE * TERMINAL_SIZE
    }

    /// Checks that the parameters describe a buildable architecture.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("nc", self.nc),
            ("ndf", self.ndf),
            ("ngf", self.ngf),
            ("nz", self.nz),
            ("num_classes", self.num_classes),
            ("sequencer_hidden", self.sequencer_hidden),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(Error::config(format!("{name} must be positive, got {value}")));
            }
        }

        let t = self.time_steps;
        if t < MIN_TIME_STEPS || t & (t - 1) != 0 {
            return Err(Error::config(format!(
                "time_steps must be a power of two >= {MIN_TIME_STEPS}, got {t}"
            )));
        }
        if self.generator_embedding_dim() < 1 {
            return Err(Error::config(format!(
                "num_classes {} leaves an empty generator label embedding (ratio {GENERATOR_EMBEDDING_RATIO})",
                self.num_classes
            )));
        }
        if self.discriminator_embedding_dim() < 1 {
            return Err(Error::config(format!(
                "num_classes {} leaves an empty discriminator label embedding for {t} frames",
                self.num_classes
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(0..self.num_classes).contains(&self.fake_label) {
            return Err(Error::config(format!(
                "fake_label {} is outside [0, {})",
                self.fake_label, self.num_classes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub root_dir: PathBuf,
    /// Defaults to `<parent of root_dir>/ucfTrainTestlist/classInd.txt`.
    #[serde(default)]
    pub class_index: Option<PathBuf>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub dataset: Option<DatasetConfig>,
    #[serde(
        serialize_with = "serialize_device",
        deserialize_with = "deserialize_device",
        default = "default_device"
    )]
    pub device: Device,
    /// Number of batch shards per forward pass; 1 runs the whole batch at once.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            dataset: None,
            device: default_device(),
            shards: default_shards(),
        }
    }
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Config = json5::from_str(&text)?;
        config.model.validate()?;
        if config.shards == 0 {
            return Err(Error::config("shards must be at least 1"));
        }
        Ok(config)
    }
}

fn default_extensions() -> Vec<String> {
    vec!["gif".into()]
}

fn default_device() -> Device {
    Device::cuda_if_available()
}

fn default_shards() -> usize {
    1
}

fn serialize_device<S>(device: &Device, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(n) => format!("cuda({})", n),
        other => return Err(S::Error::custom(format!("unsupported device {:?}", other))),
    };
    text.serialize(serializer)
}

fn deserialize_device<'de, D>(deserializer: D) -> std::result::Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_device(&name).map_err(D::Error::custom)
}

pub fn parse_device(name: &str) -> std::result::Result<Device, String> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::cuda_if_available()),
        _ => {
            let prefix = "cuda(";
            let suffix = ")";
            if name.starts_with(prefix) && name.ends_with(suffix) {
                let number: usize = name[prefix.len()..(name.len() - suffix.len())]
                    .parse()
                    .map_err(|_err| format!("invalid device name {}", name))?;
                Ok(Device::Cuda(number))
            } else {
                Err(format!("invalid device name {}", name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.generator_embedding_dim(), 6);
        assert_eq!(config.discriminator_embedding_dim(), 6);
        assert_eq!(config.clip_feature_dim(), 64 * 8 * 36);
    }

    #[test]
    fn time_steps_must_be_power_of_two() {
        for t in [8, 24, 48] {
            let config = ModelConfig {
                time_steps: t,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::Configuration(_))), "t = {t}");
        }
        let config = ModelConfig {
            time_steps: 32,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.clip_feature_dim(), 64 * 8 * 2 * 36);
    }

    #[test]
    fn embedding_width_shrinks_with_time_steps() {
        let config = ModelConfig {
            num_classes: 40,
            time_steps: 32,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn parse_config_file() {
        let text = r#"{
            model: { ndf: 8, ngf: 8, time_steps: 32 },
            device: "cpu",
            shards: 2,
        }"#;
        let config: Config = json5::from_str(text).unwrap();
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.shards, 2);
        assert_eq!(config.model.ndf, 8);
        assert_eq!(config.model.nz, 60);
        assert!(config.dataset.is_none());
    }

    #[test]
    fn parse_device_names() {
        assert_eq!(parse_device("cuda(1)").unwrap(), Device::Cuda(1));
        assert!(parse_device("tpu").is_err());
    }
}
