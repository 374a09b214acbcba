//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working setup for a local SITL on the standard ports.

use serde::de::Error;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::rx::{RxProtocol, RC_NUM_CHANNELS};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub rx: RxConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Simulator process and dataref listener
#[derive(Debug, Deserialize, Clone)]
pub struct SimulatorConfig {
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Extra arguments, appended after the generated ones
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    /// Address the simulator is told to reach us on
    #[serde(default = "default_sim_ip")]
    pub ip: String,

    #[serde(default = "default_sim_port")]
    pub port: u16,

    /// Local UDP listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub eeprom_dir: Option<PathBuf>,

    #[serde(default)]
    pub eeprom: Option<String>,
}

/// Flight-controller MSP link
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_link_address")]
    pub address: String,

    #[serde(default = "default_min_send_ms")]
    pub min_send_ms: u64,

    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
}

/// RC receiver emulation
#[derive(Debug, Deserialize, Clone)]
pub struct RxConfig {
    #[serde(default)]
    pub protocol: RxProtocol,

    #[serde(default = "default_rx_address")]
    pub address: String,

    #[serde(default = "default_channels")]
    pub channels: usize,
}

/// Replay behaviour
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReplayConfig {
    #[serde(default)]
    pub auto_arm: bool,

    #[serde(default)]
    pub failsafe: FailsafeMode,
}

/// Logging output
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// 0 = info, 1 = debug, 2+ = trace
    #[serde(default)]
    pub verbosity: u8,

    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// What the RC path does while the logged craft is in failsafe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "FailsafeSetting")]
pub enum FailsafeMode {
    /// Keep forwarding sticks
    Ignore,
    /// Stop sending RC frames altogether
    NoPulse,
    /// Hold throttle at this PWM value
    Throttle(u16),
}

impl Default for FailsafeMode {
    fn default() -> Self {
        FailsafeMode::Throttle(default_failsafe_throttle())
    }
}

impl fmt::Display for FailsafeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailsafeMode::Ignore => f.write_str("ignore"),
            FailsafeMode::NoPulse => f.write_str("nopulse"),
            FailsafeMode::Throttle(pwm) => write!(f, "throttle {}", pwm),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FailsafeSetting {
    Pwm(u16),
    Name(String),
}

impl TryFrom<FailsafeSetting> for FailsafeMode {
    type Error = String;

    fn try_from(setting: FailsafeSetting) -> std::result::Result<Self, Self::Error> {
        match setting {
            FailsafeSetting::Pwm(pwm) => Ok(FailsafeMode::Throttle(pwm)),
            FailsafeSetting::Name(name) => match name.to_ascii_lowercase().as_str() {
                "ignore" => Ok(FailsafeMode::Ignore),
                "nopulse" => Ok(FailsafeMode::NoPulse),
                other => other
                    .parse()
                    .map(FailsafeMode::Throttle)
                    .map_err(|_| format!("unknown failsafe mode \"{}\"", name)),
            },
        }
    }
}

// Default value functions
fn default_executable() -> String { "inav_SITL".to_string() }
fn default_auto_start() -> bool { true }
fn default_sim_ip() -> String { "127.0.0.1".to_string() }
fn default_sim_port() -> u16 { 49000 }
fn default_listen() -> String { "0.0.0.0:49000".to_string() }

fn default_link_address() -> String { "127.0.0.1:5760".to_string() }
fn default_min_send_ms() -> u64 { 50 }
fn default_connect_timeout_s() -> u64 { 30 }

fn default_rx_address() -> String { "127.0.0.1:5761".to_string() }
fn default_channels() -> usize { RC_NUM_CHANNELS }

fn default_failsafe_throttle() -> u16 { 800 }

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            auto_start: default_auto_start(),
            ip: default_sim_ip(),
            port: default_sim_port(),
            listen: default_listen(),
            eeprom_dir: None,
            eeprom: None,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: default_link_address(),
            min_send_ms: default_min_send_ms(),
            connect_timeout_s: default_connect_timeout_s(),
        }
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            protocol: RxProtocol::default(),
            address: default_rx_address(),
            channels: default_channels(),
        }
    }
}

impl SimulatorConfig {
    /// EEPROM image path, `eeprom_dir/eeprom` when both are set
    pub fn eeprom_path(&self) -> Option<PathBuf> {
        let eeprom = self.eeprom.as_ref()?;
        Some(match &self.eeprom_dir {
            Some(dir) => dir.join(eeprom),
            None => PathBuf::from(eeprom),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fl2sitl::config::Config;
    ///
    /// let config = Config::load("fl2sitl.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.simulator.auto_start && self.simulator.executable.is_empty() {
            return Err(config_error("simulator executable cannot be empty with auto_start"));
        }

        if self.simulator.listen.is_empty() {
            return Err(config_error("simulator listen address cannot be empty"));
        }

        if self.link.address.is_empty() {
            return Err(config_error("link address cannot be empty"));
        }

        if !(10..=1000).contains(&self.link.min_send_ms) {
            return Err(config_error("min_send_ms must be between 10 and 1000"));
        }

        if self.link.connect_timeout_s == 0 {
            return Err(config_error("connect_timeout_s must be greater than 0"));
        }

        if !(4..=RC_NUM_CHANNELS).contains(&self.rx.channels) {
            return Err(config_error(format!(
                "rx channels must be between 4 and {}",
                RC_NUM_CHANNELS
            )));
        }

        if self.rx.protocol != RxProtocol::Msp && self.rx.address.is_empty() {
            return Err(config_error("rx address cannot be empty"));
        }

        if let FailsafeMode::Throttle(pwm) = self.replay.failsafe {
            if !(800..=2000).contains(&pwm) {
                return Err(config_error("failsafe throttle must be between 800 and 2000"));
            }
        }

        if self.logging.verbosity > 5 {
            return Err(config_error("verbosity must be between 0 and 5"));
        }

        Ok(())
    }
}

fn config_error<T: fmt::Display>(msg: T) -> BridgeError {
    BridgeError::Config(toml::de::Error::custom(msg))
}
