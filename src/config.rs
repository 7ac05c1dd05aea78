//! # Controller Configuration
//!
//! Everything has a default, so an empty file (or none at all) gives a
//! usable three axis machine on `/dev/ttyAMA0`.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 230400
//!
//! [timing]
//! state_flush_ms = 250
//!
//! [[motors]]
//! axis = "x"
//! homing_mode = "switch-min"
//! max_soft_limit = 300.0
//!
//! [settings]
//! sv = 5000
//! ```

// src/config.rs - Controller configuration file
use crate::state::{Axis, HomingMode, StateValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub i2c: I2cConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default = "default_motors")]
    pub motors: Vec<MotorConfig>,
    /// Free-form device variables, sent as `$name=value`.
    #[serde(default)]
    pub settings: BTreeMap<String, StateValue>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            i2c: I2cConfig::default(),
            timing: TimingConfig::default(),
            web: WebConfig::default(),
            motors: default_motors(),
            settings: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.motors.len() > crate::state::MOTOR_COUNT {
            return Err(ConfigError::Invalid(format!(
                "{} motors configured, the controller has {}",
                self.motors.len(),
                crate::state::MOTOR_COUNT
            )));
        }
        for (i, m) in self.motors.iter().enumerate() {
            if m.homing_mode != HomingMode::Manual && m.max_soft_limit <= m.min_soft_limit {
                return Err(ConfigError::Invalid(format!(
                    "motor {}: max_soft_limit must be greater than min_soft_limit",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Serial link to the motion controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_true")]
    pub rtscts: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            rtscts: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct I2cConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bus character device.
    #[serde(default = "default_i2c_device")]
    pub device: String,
    #[serde(default = "default_avr_address")]
    pub avr_address: u8,
    #[serde(default = "default_power_address")]
    pub power_address: u8,
    #[serde(default = "default_lcd_address")]
    pub lcd_address: u8,
    /// Read attempts per power monitor poll, `retry_delay_ms` apart.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl I2cConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: default_i2c_device(),
            avr_address: default_avr_address(),
            power_address: default_power_address(),
            lcd_address: default_lcd_address(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_state_flush_ms")]
    pub state_flush_ms: u64,
    #[serde(default = "default_cycle_check_ms")]
    pub cycle_check_ms: u64,
    #[serde(default = "default_power_poll_ms")]
    pub power_poll_ms: u64,
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
}

impl TimingConfig {
    pub fn state_flush(&self) -> Duration {
        Duration::from_millis(self.state_flush_ms)
    }

    pub fn cycle_check(&self) -> Duration {
        Duration::from_millis(self.cycle_check_ms)
    }

    pub fn power_poll(&self) -> Duration {
        Duration::from_millis(self.power_poll_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            state_flush_ms: default_state_flush_ms(),
            cycle_check_ms: default_cycle_check_ms(),
            power_poll_ms: default_power_poll_ms(),
            reconnect_ms: default_reconnect_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// One motor channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotorConfig {
    pub axis: Axis,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_homing_mode")]
    pub homing_mode: HomingMode,
    #[serde(default = "default_step_angle")]
    pub step_angle: f64,
    #[serde(default = "default_travel_per_rev")]
    pub travel_per_rev: f64,
    #[serde(default = "default_microsteps")]
    pub microsteps: u32,
    /// m/min
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    /// km/min²
    #[serde(default = "default_max_accel")]
    pub max_accel: f64,
    /// km/min³
    #[serde(default = "default_max_jerk")]
    pub max_jerk: f64,
    #[serde(default)]
    pub min_soft_limit: f64,
    #[serde(default)]
    pub max_soft_limit: f64,
    #[serde(default = "default_search_velocity")]
    pub search_velocity: f64,
    #[serde(default = "default_latch_velocity")]
    pub latch_velocity: f64,
    #[serde(default = "default_latch_backoff")]
    pub latch_backoff: f64,
    #[serde(default)]
    pub zero_backoff: f64,
}

impl MotorConfig {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            enabled: true,
            reverse: false,
            homing_mode: default_homing_mode(),
            step_angle: default_step_angle(),
            travel_per_rev: default_travel_per_rev(),
            microsteps: default_microsteps(),
            max_velocity: default_max_velocity(),
            max_accel: default_max_accel(),
            max_jerk: default_max_jerk(),
            min_soft_limit: 0.0,
            max_soft_limit: 0.0,
            search_velocity: default_search_velocity(),
            latch_velocity: default_latch_velocity(),
            latch_backoff: default_latch_backoff(),
            zero_backoff: 0.0,
        }
    }

    /// The motor's variables by their device code, e.g. `vm` for max velocity.
    pub fn settings(&self) -> Vec<(&'static str, StateValue)> {
        vec![
            ("an", StateValue::from(self.axis.index() as u32)),
            ("me", StateValue::from(self.enabled)),
            ("rv", StateValue::from(self.reverse)),
            ("homing_mode", StateValue::from(self.homing_mode.as_str())),
            ("sa", StateValue::from(self.step_angle)),
            ("tr", StateValue::from(self.travel_per_rev)),
            ("mi", StateValue::from(self.microsteps)),
            ("vm", StateValue::from(self.max_velocity)),
            ("am", StateValue::from(self.max_accel)),
            ("jm", StateValue::from(self.max_jerk)),
            ("tn", StateValue::from(self.min_soft_limit)),
            ("tm", StateValue::from(self.max_soft_limit)),
            ("sv", StateValue::from(self.search_velocity)),
            ("lv", StateValue::from(self.latch_velocity)),
            ("lb", StateValue::from(self.latch_backoff)),
            ("zb", StateValue::from(self.zero_backoff)),
        ]
    }
}

fn default_motors() -> Vec<MotorConfig> {
    vec![
        MotorConfig::new(Axis::X),
        MotorConfig::new(Axis::Y),
        MotorConfig::new(Axis::Z),
        MotorConfig {
            enabled: false,
            ..MotorConfig::new(Axis::A)
        },
    ]
}

fn default_true() -> bool { true }
fn default_port() -> String { "/dev/ttyAMA0".to_string() }
fn default_baud() -> u32 { 230400 }
fn default_i2c_device() -> String { "/dev/i2c-1".to_string() }
fn default_avr_address() -> u8 { 0x2b }
fn default_power_address() -> u8 { crate::hardware::power::DEFAULT_ADDRESS }
fn default_lcd_address() -> u8 { crate::hardware::lcd::DEFAULT_ADDRESS }
fn default_retries() -> u32 { 5 }
fn default_retry_delay_ms() -> u64 { 100 }
fn default_state_flush_ms() -> u64 { 250 }
fn default_cycle_check_ms() -> u64 { 500 }
fn default_power_poll_ms() -> u64 { 250 }
fn default_reconnect_ms() -> u64 { 1000 }
fn default_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_homing_mode() -> HomingMode { HomingMode::Manual }
fn default_step_angle() -> f64 { 1.8 }
fn default_travel_per_rev() -> f64 { 5.0 }
fn default_microsteps() -> u32 { 32 }
fn default_max_velocity() -> f64 { 5.0 }
fn default_max_accel() -> f64 { 10.0 }
fn default_max_jerk() -> f64 { 50.0 }
fn default_search_velocity() -> f64 { 0.5 }
fn default_latch_velocity() -> f64 { 0.1 }
fn default_latch_backoff() -> f64 { 5.0 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
