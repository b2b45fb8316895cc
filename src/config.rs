use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_rpc::client::ReconnectConfig;
use tether_rpc::codec::FrameCodec;
use tether_sandbox::ExecutorConfig;

/// Environment variable naming the config file, also read from `.env`
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tether.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub socket_path: PathBuf,
    /// Frames with a larger JSON body are gzip-compressed
    pub compression_threshold: usize,
    /// Larger frames are refused and the connection dropped
    pub max_frame_len: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            compression_threshold: FrameCodec::DEFAULT_COMPRESSION_THRESHOLD,
            max_frame_len: FrameCodec::DEFAULT_MAX_FRAME_LEN,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Top-level configuration, every section optional
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TetherConfig {
    pub rpc: RpcConfig,
    pub sandbox: ExecutorConfig,
}

impl TetherConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `explicit` if given, else the file named by [`CONFIG_ENV`], else
    /// fall back to defaults
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Err(e) = dotenvy::dotenv() {
            log::trace!("No .env file loaded: {e}");
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => {
                log::debug!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let reconnect = &self.rpc.reconnect;
        if reconnect.min_interval_ms > reconnect.max_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "rpc.reconnect.min_interval_ms ({}) exceeds max_interval_ms ({})",
                reconnect.min_interval_ms, reconnect.max_interval_ms
            )));
        }
        if reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "rpc.reconnect.backoff_multiplier must be at least 1.0".to_owned(),
            ));
        }
        if self.rpc.max_frame_len == 0 {
            return Err(ConfigError::Invalid(
                "rpc.max_frame_len must be positive".to_owned(),
            ));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be positive".to_owned(),
            ));
        }
        if self.sandbox.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.mailbox_capacity must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.rpc.compression_threshold).with_max_frame_len(self.rpc.max_frame_len)
    }
}
