// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Node configuration: startup settings and the live-updatable recording configuration.
//!
//! Startup settings are merged from four sources in increasing precedence: built-in defaults,
//! a YAML configuration file, `ROTORLOG_`-prefixed environment variables, and command-line
//! flags (applied by the binary). The updatable subset additionally arrives at runtime as YAML
//! payloads on the configuration topic and is re-parsed wholesale on every message.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context as _;
use jsonwebtoken::{Algorithm, EncodingKey};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::uploader::CompressionMode;

/// Default values for the node configuration.
pub mod defaults {
    use super::*;

    /// Size in bytes at which the writer rolls over to a new segment.
    pub const SIZE_THRESHOLD: i64 = 10_000_000;
    /// Maximum number of concurrently running uploads.
    pub const MAX_UPLOAD_COUNT: usize = 5;
    /// Seconds to wait before restarting a failed recorder.
    pub const RETRY_DELAY_SECS: u64 = 5;
    /// Lifetime in seconds of the signed-URL request tokens.
    pub const TOKEN_LIFETIME_SECS: u64 = 120;
    /// Command used to spawn the segment writer.
    pub const ROS_COMMAND: &str = "ros2";
    /// Location of the device's provisioned signing key.
    pub const PRIVATE_KEY_PATH: &str = "/enclave/rsa_private.pem";

    /// Returns the default recorder restart delay.
    pub fn retry_delay() -> Duration {
        Duration::from_secs(RETRY_DELAY_SECS)
    }

    /// Returns the default signed-URL token lifetime.
    pub fn token_lifetime() -> Duration {
        Duration::from_secs(TOKEN_LIFETIME_SECS)
    }

    /// Returns the default recording destination directory.
    pub fn dest_dir() -> PathBuf {
        PathBuf::from(".")
    }

    /// Returns the default signing key path.
    pub fn private_key() -> PathBuf {
        PathBuf::from(PRIVATE_KEY_PATH)
    }
}

/// Errors produced while parsing or validating a configuration payload.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The payload is not valid YAML.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// The payload is valid YAML but not a mapping.
    #[error("configuration must be a YAML mapping")]
    NotAMapping,

    /// The `topics` key has an unsupported shape.
    #[error("'topics' must be an empty string, '*' or a list of strings")]
    InvalidTopics,

    /// A numeric key does not hold a number.
    #[error("'{0}' must be an integer")]
    InvalidInteger(&'static str),

    /// The `extra_args` key is not a list of strings.
    #[error("'extra_args' must be a list of strings")]
    InvalidExtraArgs,

    /// The upload concurrency bound is negative.
    #[error("'max-upload-count' must be non-negative")]
    NegativeMaxUploadCount,

    /// The compression mode is not one of the supported values.
    #[error("unknown compression mode: {0}")]
    UnknownCompressionMode(String),
}

/// The set of topics the recorder should capture.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TopicSelection {
    /// Record nothing; the recorder is not started.
    #[default]
    None,
    /// Record every topic on the bus.
    All,
    /// Record exactly the listed topics; an empty list behaves like [`TopicSelection::None`].
    Explicit(Vec<String>),
}

impl TopicSelection {
    /// Parses the flag/environment form: empty means none, `*` means all, anything else is a
    /// comma-separated topic list.
    pub fn parse_flag(value: &str) -> Self {
        match value {
            "" => Self::None,
            "*" => Self::All,
            _ => Self::Explicit(value.split(',').map(str::to_owned).collect()),
        }
    }

    fn from_yaml(value: &serde_yaml::Value) -> Result<Self, ConfigError> {
        match value {
            serde_yaml::Value::Null => Ok(Self::None),
            serde_yaml::Value::String(value) if value.is_empty() => Ok(Self::None),
            serde_yaml::Value::String(value) if value == "*" => Ok(Self::All),
            serde_yaml::Value::Sequence(entries) => entries
                .iter()
                .map(|entry| {
                    entry
                        .as_str()
                        .map(str::to_owned)
                        .ok_or(ConfigError::InvalidTopics)
                })
                .collect::<Result<_, _>>()
                .map(Self::Explicit),
            _ => Err(ConfigError::InvalidTopics),
        }
    }

}

/// The configuration subset that can be replaced at runtime through the configuration topic.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatableConfig {
    /// Topics to record.
    pub topics: TopicSelection,
    /// Segment size threshold in bytes; non-positive disables splitting.
    pub size_threshold: i64,
    /// Extra arguments appended verbatim to the writer command line.
    pub extra_args: Vec<String>,
    /// Maximum number of concurrent uploads; zero disables uploading.
    pub max_upload_count: usize,
    /// Compression applied to segments while uploading.
    pub compression_mode: CompressionMode,
}

impl Default for UpdatableConfig {
    fn default() -> Self {
        Self {
            topics: TopicSelection::default(),
            size_threshold: defaults::SIZE_THRESHOLD,
            extra_args: Vec::new(),
            max_upload_count: defaults::MAX_UPLOAD_COUNT,
            compression_mode: CompressionMode::default(),
        }
    }
}

impl UpdatableConfig {
    /// Parses a configuration payload.
    ///
    /// Unknown keys are ignored and null values fall back to the defaults, so that a partial
    /// payload only overrides what it names. The payload is dynamically typed (the original
    /// producers send floats for integers and `"*"` markers for lists), so the fields are
    /// extracted from a [`serde_yaml::Value`] rather than through a derived deserializer.
    pub fn parse_yaml(payload: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(payload)?;
        let mut config = Self::default();
        let mapping = match &value {
            serde_yaml::Value::Null => return Ok(config),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => return Err(ConfigError::NotAMapping),
        };
        for (key, value) in mapping {
            let (Some(key), false) = (key.as_str(), value.is_null()) else {
                continue;
            };
            match key {
                "topics" => config.topics = TopicSelection::from_yaml(value)?,
                "size_threshold" => {
                    config.size_threshold = value
                        .as_i64()
                        .ok_or(ConfigError::InvalidInteger("size_threshold"))?;
                }
                "extra_args" => {
                    let entries = value
                        .as_sequence()
                        .ok_or(ConfigError::InvalidExtraArgs)?
                        .iter()
                        .map(|entry| {
                            entry
                                .as_str()
                                .map(str::to_owned)
                                .ok_or(ConfigError::InvalidExtraArgs)
                        })
                        .collect::<Result<_, _>>()?;
                    config.extra_args = entries;
                }
                "max_upload_count" => {
                    // Floats are truncated toward zero to stay permissive with producers that
                    // send `2.0`-style numbers.
                    let count = value
                        .as_i64()
                        .or_else(|| value.as_f64().map(|count| count as i64))
                        .ok_or(ConfigError::InvalidInteger("max_upload_count"))?;
                    if count < 0 {
                        return Err(ConfigError::NegativeMaxUploadCount);
                    }
                    config.max_upload_count = count as usize;
                }
                "compression_mode" => {
                    let mode = value
                        .as_str()
                        .ok_or_else(|| {
                            ConfigError::UnknownCompressionMode(yaml_scalar_to_string(value))
                        })?
                        .parse::<CompressionMode>()
                        .map_err(|error| ConfigError::UnknownCompressionMode(error.0))?;
                    config.compression_mode = mode;
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> String {
    serde_yaml::to_string(value)
        .map(|rendered| rendered.trim_end().to_owned())
        .unwrap_or_default()
}

/// The signing algorithm of the device's provisioned key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    #[default]
    #[serde(rename = "RS256")]
    Rs256,
    /// ECDSA P-256 with SHA-256.
    #[serde(rename = "ES256")]
    Es256,
}

impl KeyAlgorithm {
    /// Returns the corresponding JWT algorithm.
    pub fn jwt_algorithm(self) -> Algorithm {
        match self {
            Self::Rs256 => Algorithm::RS256,
            Self::Es256 => Algorithm::ES256,
        }
    }

    /// Loads the PEM-encoded signing key at `path`.
    pub fn load_key(self, path: &std::path::Path) -> anyhow::Result<EncodingKey> {
        let pem = std::fs::read(path)
            .with_context(|| format!("unable to read signing key from {}", path.display()))?;
        let key = match self {
            Self::Rs256 => EncodingKey::from_rsa_pem(&pem),
            Self::Es256 => EncodingKey::from_ec_pem(&pem),
        };
        key.with_context(|| format!("invalid {self:?} signing key in {}", path.display()))
    }
}

impl FromStr for KeyAlgorithm {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "RS256" => Ok(Self::Rs256),
            "ES256" => Ok(Self::Es256),
            _ => anyhow::bail!("unsupported key algorithm: {value}"),
        }
    }
}

/// The full node configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// The provisioned device id. Required.
    pub device_id: String,
    /// The tenant the device belongs to.
    pub tenant_id: String,
    /// Base URL of the backend issuing signed upload URLs. Required.
    pub backend_url: String,
    /// Path to the PEM-encoded signing key.
    pub private_key: PathBuf,
    /// Algorithm of the signing key.
    pub key_algorithm: KeyAlgorithm,
    /// Directory under which recordings are stored.
    pub dest_dir: PathBuf,
    /// Command used to spawn the segment writer.
    pub ros_command: String,
    /// Delay before restarting a failed recorder.
    pub retry_delay: Duration,
    /// Lifetime of signed-URL request tokens.
    pub token_lifetime: Duration,
    /// Initial value of the updatable subset, replaced by configuration messages at runtime.
    pub initial: UpdatableConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            tenant_id: String::new(),
            backend_url: String::new(),
            private_key: defaults::private_key(),
            key_algorithm: KeyAlgorithm::default(),
            dest_dir: defaults::dest_dir(),
            ros_command: defaults::ROS_COMMAND.to_owned(),
            retry_delay: defaults::retry_delay(),
            token_lifetime: defaults::token_lifetime(),
            initial: UpdatableConfig::default(),
        }
    }
}

/// Startup-only keys of the configuration file. The updatable subset of the same file goes
/// through [`UpdatableConfig::parse_yaml`] so that both sources obey identical validation.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct StartupOverlay {
    device_id: Option<String>,
    tenant_id: Option<String>,
    backend_url: Option<String>,
    private_key: Option<PathBuf>,
    key_algorithm: Option<KeyAlgorithm>,
    dest_dir: Option<PathBuf>,
    ros_command: Option<String>,
    #[serde_as(as = "Option<DurationSeconds>")]
    #[serde(rename = "retry_delay_secs", default)]
    retry_delay: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds>")]
    #[serde(rename = "token_lifetime_secs", default)]
    token_lifetime: Option<Duration>,
}

impl NodeConfig {
    /// Environment variable prefix recognized by [`NodeConfig::apply_env`].
    pub const ENV_PREFIX: &'static str = "ROTORLOG_";

    /// Loads the configuration from a YAML file, falling back to defaults when `path` is `None`.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        tracing::debug!(path = %path.display(), "reading configuration from file");
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("unable to load configuration from {}", path.display()))?;
        let overlay: StartupOverlay = serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid configuration file {}", path.display()))?;
        let initial = UpdatableConfig::parse_yaml(&contents)
            .with_context(|| format!("invalid configuration file {}", path.display()))?;

        let mut config = Self {
            initial,
            ..Self::default()
        };
        let StartupOverlay {
            device_id,
            tenant_id,
            backend_url,
            private_key,
            key_algorithm,
            dest_dir,
            ros_command,
            retry_delay,
            token_lifetime,
        } = overlay;
        merge(&mut config.device_id, device_id);
        merge(&mut config.tenant_id, tenant_id);
        merge(&mut config.backend_url, backend_url);
        merge(&mut config.private_key, private_key);
        merge(&mut config.key_algorithm, key_algorithm);
        merge(&mut config.dest_dir, dest_dir);
        merge(&mut config.ros_command, ros_command);
        merge(&mut config.retry_delay, retry_delay);
        merge(&mut config.token_lifetime, token_lifetime);
        Ok(config)
    }

    /// Overrides settings from `ROTORLOG_`-prefixed environment variables.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(value) = env_var("DEVICE_ID") {
            self.device_id = value;
        }
        if let Some(value) = env_var("TENANT_ID") {
            self.tenant_id = value;
        }
        if let Some(value) = env_var("BACKEND_URL") {
            self.backend_url = value;
        }
        if let Some(value) = env_var("PRIVATE_KEY") {
            self.private_key = PathBuf::from(value);
        }
        if let Some(value) = env_var("KEY_ALGORITHM") {
            self.key_algorithm = value.parse()?;
        }
        if let Some(value) = env_var("DEST_DIR") {
            self.dest_dir = PathBuf::from(value);
        }
        if let Some(value) = env_var("ROS_COMMAND") {
            self.ros_command = value;
        }
        if let Some(value) = env_var("TOPICS") {
            self.initial.topics = TopicSelection::parse_flag(&value);
        }
        if let Some(value) = env_var("SIZE_THRESHOLD") {
            self.initial.size_threshold = value
                .parse()
                .with_context(|| format!("invalid {}SIZE_THRESHOLD", Self::ENV_PREFIX))?;
        }
        if let Some(value) = env_var("EXTRA_ARGS") {
            self.initial.extra_args = parse_comma_separated(&value);
        }
        if let Some(value) = env_var("MAX_UPLOAD_COUNT") {
            self.initial.max_upload_count = value
                .parse()
                .with_context(|| format!("invalid {}MAX_UPLOAD_COUNT", Self::ENV_PREFIX))?;
        }
        if let Some(value) = env_var("COMPRESSION_MODE") {
            self.initial.compression_mode = value.parse::<CompressionMode>()?;
        }
        Ok(())
    }

    /// Checks the required settings after all sources are merged.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.device_id.is_empty(), "a device id is required");
        anyhow::ensure!(!self.backend_url.is_empty(), "a backend URL is required");
        Ok(())
    }

    /// The key-expression namespace of this node on the message bus.
    pub fn namespace(&self) -> String {
        format!("rotorlog/{}", self.device_id)
    }
}

fn merge<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}{name}", NodeConfig::ENV_PREFIX)).ok()
}

/// Splits a comma-separated flag value, mapping the empty string to an empty list.
pub fn parse_comma_separated(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split(',').map(str::to_owned).collect()
    }
}
