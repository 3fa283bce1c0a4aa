//! Configuration options for a consensus group.
//!
//! All group parameters are fixed at creation time and carried explicitly;
//! there is no module-level mutable state. Threshold combinations that
//! would make the group unsafe or non-live are rejected up front.

use std::io::Write;
use std::path::PathBuf;

use log::{error, info};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Configuration {
    pub group: GroupConfig,
    pub ondemand: OnDemandConfig,
}

/// Parameters of the live-messaging (witnessed) consensus group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupConfig {
    /// Number of participants. Node identifiers are `0..size`.
    pub size: usize,
    /// Maximum number of participants that may crash.
    pub max_faulty: usize,
    /// Last logical time-step a node will start; the node reports itself
    /// finished once its clock would pass this.
    pub max_steps: u64,
}

/// Parameters of the client-driven (on-demand) consensus group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OnDemandConfig {
    /// Number of per-member registers. Node identifiers are `0..size`.
    pub size: usize,
    /// Maximum number of registers that may become unreachable.
    pub max_faulty: usize,
    /// Initial delay before retrying a failed register access, in
    /// milliseconds.
    pub retry_initial_delay_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl GroupConfig {
    pub fn new(size: usize, max_faulty: usize, max_steps: u64) -> GroupConfig {
        GroupConfig {
            size,
            max_faulty,
            max_steps,
        }
    }

    /// Group with an explicit acknowledgement/witness threshold instead of
    /// a crash budget.
    pub fn with_threshold(size: usize, threshold: usize, max_steps: u64) -> GroupConfig {
        GroupConfig {
            size,
            max_faulty: size.saturating_sub(threshold),
            max_steps,
        }
    }

    /// Acknowledgement and witness threshold: `size - max_faulty`.
    pub fn threshold(&self) -> usize {
        self.size - self.max_faulty
    }

    /// A witnessed group is safe only while thresholds form a majority.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(ConfigurationError::UnsafeThresholds(
                "group size must be at least 1".to_string(),
            ));
        }
        if self.max_faulty >= self.size {
            return Err(ConfigurationError::UnsafeThresholds(format!(
                "crash budget {} leaves no live participant in a group of {}",
                self.max_faulty, self.size
            )));
        }
        let threshold = self.threshold();
        if threshold * 2 <= self.size {
            return Err(ConfigurationError::UnsafeThresholds(format!(
                "threshold {threshold} is not a majority of {}",
                self.size
            )));
        }
        Ok(())
    }
}

impl OnDemandConfig {
    pub fn new(size: usize, max_faulty: usize) -> OnDemandConfig {
        OnDemandConfig {
            size,
            max_faulty,
            retry_initial_delay_ms: 50,
            retry_max_delay_ms: 5_000,
        }
    }

    /// Receive threshold `Tr = N - F`: registers that must answer before a
    /// step completes.
    pub fn receive_threshold(&self) -> usize {
        self.size - self.max_faulty
    }

    /// Spread threshold `Ts = N - Tr + 1`: appearances a value needs across
    /// second-step answers to count as broadcast.
    pub fn spread_threshold(&self) -> usize {
        self.size - self.receive_threshold() + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.max_faulty >= self.size {
            return Err(ConfigurationError::UnsafeThresholds(format!(
                "{} of {} registers may fail",
                self.max_faulty, self.size
            )));
        }
        let n = self.size as i64;
        let tr = self.receive_threshold() as i64;
        let ts = self.spread_threshold() as i64;
        if tr + ts <= n {
            return Err(ConfigurationError::UnsafeThresholds(format!(
                "receive threshold {tr} and spread threshold {ts} do not overlap in a group of {n}"
            )));
        }
        if n * (tr - ts + 1) - tr * (n - tr) <= 0 {
            return Err(ConfigurationError::UnsafeThresholds(format!(
                "thresholds Tr={tr}, Ts={ts} give no commit progress for N={n}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unsafe consensus thresholds: {}", .0)]
    UnsafeThresholds(String),
    #[error("configuration file exists: '{}'", .0)]
    ConfigurationFileExists(String),
    #[error("configuration file does not exist: '{}'", .0)]
    ConfigurationFileDoesNotExist(String),
    #[error("configuration io error")]
    IoError(#[from] std::io::Error),
    #[error("{}", .0)]
    Other(String),
}

const QUESERA_DIR_NAME: &str = ".quesera";
const QUESERA_CONFIG_FILE: &str = "quesera.toml";

type Result<T> = std::result::Result<T, ConfigurationError>;

impl Configuration {
    pub fn try_load(path: PathBuf) -> Result<Configuration> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigurationError::Other(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Other(e.to_string()))
    }

    pub fn try_load_from_home_dir(node_name: &str) -> Result<Configuration> {
        let file_path = Configuration::config_file_root(node_name)?;
        Configuration::try_load(file_path)
    }

    pub fn try_create_root_dir(&self, node_name: &str) -> Result<()> {
        let conf_path = Configuration::node_dir(node_name)?;
        if !conf_path.exists() {
            std::fs::create_dir_all(conf_path)?;
        }

        let file_path = Configuration::config_file_root(node_name)?;
        if file_path.exists() {
            return Err(ConfigurationError::ConfigurationFileExists(
                file_path.to_str().unwrap().to_string(),
            ));
        }

        self.write(file_path)?;
        Ok(())
    }

    pub fn try_update_root(&self, node_name: &str) -> Result<()> {
        let file_path = Configuration::config_file_root(node_name)?;
        if !file_path.exists() {
            error!(
                "Configuration file does not exist {}",
                file_path.to_str().unwrap()
            );
            return Err(ConfigurationError::ConfigurationFileDoesNotExist(
                file_path.to_str().unwrap().to_string(),
            ));
        }
        self.write(file_path)?;
        Ok(())
    }

    pub fn config_file_root(node_name: &str) -> Result<PathBuf> {
        Ok(Self::node_dir(node_name)?.join(QUESERA_CONFIG_FILE))
    }

    pub fn root_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(QUESERA_DIR_NAME))
            .ok_or(ConfigurationError::Other(
                "Could not find home directory".to_string(),
            ))
    }

    pub(crate) fn node_dir(node_name: &str) -> Result<PathBuf> {
        Ok(Self::root_dir()?.join(node_name))
    }

    fn write(&self, file_path: PathBuf) -> Result<()> {
        let config = toml::to_string(&self).map_err(|e| {
            ConfigurationError::Other(format!("Failed to serialize configuration: {e}",))
        })?;

        if file_path.exists() {
            info!("Updating configuration file: '{}'", file_path.display());
        } else {
            info!("Writing configuration to file: '{}'", file_path.display());
        }

        let mut file = std::fs::File::create(&file_path)?;
        file.write_all(config.as_bytes())?;

        Ok(())
    }
}
