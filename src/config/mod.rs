use crate::metering_sml::structs::DispatchMode;
use log::info;
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::HashSet;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_PATHS: [&str; 2] = ["config/smlreader.yaml", "smlreader.yaml"];
const MIN_BUFFER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to find a config on {0}")]
    NotFound(String),
    #[error("Unable to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to parse config file {path}: {source}")]
    Parse { path: String, source: serde_yml::Error },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One read head, fed either by replayed telegrams or by a device path.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HeadConfig {
    pub pin: u8,
    #[serde(default)]
    pub replay: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

fn sml_buffer_size_default() -> usize { return 400 }
fn sml_expire_secs_default() -> u64 { return 60 }
fn sml_print_interval_secs_default() -> u64 { return 5 }
fn sml_read_interval_ms_default() -> u64 { return 5000 }
fn sml_dispatch_default() -> DispatchMode { return DispatchMode::Scan }
fn sml_heads_default() -> Vec<HeadConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SmlConfig {
    #[serde(default="sml_buffer_size_default")]
    pub buffer_size: usize,
    #[serde(default="sml_expire_secs_default")]
    pub expire_secs: u64,           // readings older than this count as stale
    #[serde(default="sml_print_interval_secs_default")]
    pub print_interval_secs: u64,
    #[serde(default="sml_read_interval_ms_default")]
    pub read_interval_ms: u64,
    #[serde(default="sml_dispatch_default")]
    pub dispatch: DispatchMode,
    #[serde(default="sml_heads_default")]
    pub heads: Vec<HeadConfig>,
}

fn publish_interval_secs_default() -> u64 { return 20 }
fn publish_base_topic_default() -> String { return "smlreader".to_string() }
fn publish_system_id_default() -> String { return "000000".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PublishConfig {
    #[serde(default="publish_interval_secs_default")]
    pub interval_secs: u64,
    #[serde(default="publish_base_topic_default")]
    pub base_topic: String,
    #[serde(default="publish_system_id_default")]
    pub system_id: String,
}

fn sml_default() -> SmlConfig {
    return SmlConfig {
        buffer_size: sml_buffer_size_default(),
        expire_secs: sml_expire_secs_default(),
        print_interval_secs: sml_print_interval_secs_default(),
        read_interval_ms: sml_read_interval_ms_default(),
        dispatch: sml_dispatch_default(),
        heads: sml_heads_default(),
    }
}

fn publish_default() -> PublishConfig {
    return PublishConfig {
        interval_secs: publish_interval_secs_default(),
        base_topic: publish_base_topic_default(),
        system_id: publish_system_id_default(),
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="sml_default")]
    pub sml: SmlConfig,
    #[serde(default="publish_default")]
    pub publish: PublishConfig,
}

impl Config {
    /// Loads `path`, or the first of the default locations that exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => CONFIG_PATHS.iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or_else(|| ConfigError::NotFound(CONFIG_PATHS.join(" or ")))?,
        };
        let display = path.display().to_string();

        let mut file = File::open(&path).map_err(|source| ConfigError::Io { path: display.clone(), source })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|source| ConfigError::Io { path: display.clone(), source })?;

        let config = Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path: display.clone(), source },
            other => other,
        })?;
        info!("Loaded config from {} with {} read heads", display, config.sml.heads.len());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)
            .map_err(|source| ConfigError::Parse { path: "<inline>".to_string(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sml = &self.sml;
        if sml.heads.is_empty() {
            return Err(ConfigError::Invalid("no read heads configured".to_string()));
        }
        if sml.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!("buffer_size must be at least {}", MIN_BUFFER_SIZE)));
        }
        if sml.expire_secs == 0 {
            return Err(ConfigError::Invalid("expire_secs must not be 0".to_string()));
        }
        if sml.read_interval_ms == 0 {
            return Err(ConfigError::Invalid("read_interval_ms must not be 0".to_string()));
        }

        let mut pins = HashSet::new();
        for head in &sml.heads {
            if !pins.insert(head.pin) {
                return Err(ConfigError::Invalid(format!("pin {} configured twice", head.pin)));
            }
            if head.replay.is_some() == head.device.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "head on pin {} needs exactly one of replay or device", head.pin)));
            }
        }
        Ok(())
    }
}
