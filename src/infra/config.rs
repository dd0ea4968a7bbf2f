//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{DenominationTable, TableEntry};
use anyhow::Context;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// How a coin line is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderPolicy {
    /// Every debounced edge is worth the currently armed denomination
    DirectEdge,
    /// Pulse count of a burst selects the denomination from the table
    BurstCount,
}

impl DecoderPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderPolicy::DirectEdge => "direct_edge",
            DecoderPolicy::BurstCount => "burst_count",
        }
    }
}

/// Sensor level that means "coin in the chute"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorLevel {
    High,
    Low,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique kiosk identifier
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "kiosk".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_coin_pin")]
    pub pin: u8,
    #[serde(default = "default_coin_policy")]
    pub policy: DecoderPolicy,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_coin_quiet_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_coin_max_burst_ms")]
    pub max_burst_ms: u64,
    /// Value credited per edge under the direct-edge policy
    #[serde(default = "default_armed_value")]
    pub armed_value: Decimal,
    /// Overrides the built-in coin table when non-empty
    #[serde(default)]
    pub table: Vec<TableEntry>,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: default_coin_pin(),
            policy: default_coin_policy(),
            debounce_ms: default_debounce_ms(),
            quiet_period_ms: default_coin_quiet_ms(),
            max_burst_ms: default_coin_max_burst_ms(),
            armed_value: default_armed_value(),
            table: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_coin_pin() -> u8 {
    17
}

fn default_coin_policy() -> DecoderPolicy {
    DecoderPolicy::DirectEdge
}

fn default_debounce_ms() -> u64 {
    50 // Allan 123A-Pro contact bounce
}

fn default_coin_quiet_ms() -> u64 {
    500
}

fn default_coin_max_burst_ms() -> u64 {
    5000
}

fn default_armed_value() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bill_pin")]
    pub pin: u8,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_bill_quiet_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_bill_max_burst_ms")]
    pub max_burst_ms: u64,
    #[serde(default)]
    pub table: Vec<TableEntry>,
}

impl Default for BillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: default_bill_pin(),
            debounce_ms: default_debounce_ms(),
            quiet_period_ms: default_bill_quiet_ms(),
            max_burst_ms: default_bill_max_burst_ms(),
            table: Vec::new(),
        }
    }
}

fn default_bill_pin() -> u8 {
    27
}

fn default_bill_quiet_ms() -> u64 {
    1000
}

fn default_bill_max_burst_ms() -> u64 {
    15000 // 100 pulses for the largest bill
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HopperUnitConfig {
    pub value: Decimal,
    #[serde(default)]
    pub label: Option<String>,
    pub motor_pin: u8,
    pub sensor_pin: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HopperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hopper_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_hopper_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_coin_present")]
    pub coin_present: SensorLevel,
    #[serde(default = "default_hopper_units")]
    pub units: Vec<HopperUnitConfig>,
}

impl Default for HopperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_hopper_timeout_secs(),
            poll_interval_ms: default_hopper_poll_ms(),
            coin_present: default_coin_present(),
            units: default_hopper_units(),
        }
    }
}

fn default_hopper_timeout_secs() -> u64 {
    30
}

fn default_hopper_poll_ms() -> u64 {
    100
}

fn default_coin_present() -> SensorLevel {
    SensorLevel::High
}

fn default_hopper_units() -> Vec<HopperUnitConfig> {
    vec![
        HopperUnitConfig {
            value: Decimal::from(5),
            label: Some("5 Peso Coin".to_string()),
            motor_pin: 23,
            sensor_pin: 24,
        },
        HopperUnitConfig {
            value: Decimal::ONE,
            label: Some("1 Peso Coin".to_string()),
            motor_pin: 5,
            sensor_pin: 6,
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_pulse_queue_capacity")]
    pub pulse_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_session_poll_ms(),
            pulse_queue_capacity: default_pulse_queue_capacity(),
        }
    }
}

fn default_session_poll_ms() -> u64 {
    100
}

fn default_pulse_queue_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub coin: CoinConfig,
    #[serde(default)]
    pub bill: BillConfig,
    #[serde(default)]
    pub hopper: HopperConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    coin_enabled: bool,
    coin_pin: u8,
    coin_policy: DecoderPolicy,
    coin_debounce_ms: u64,
    coin_quiet_period_ms: u64,
    coin_max_burst_ms: u64,
    coin_armed_value: Decimal,
    coin_table: DenominationTable,
    bill_enabled: bool,
    bill_pin: u8,
    bill_debounce_ms: u64,
    bill_quiet_period_ms: u64,
    bill_max_burst_ms: u64,
    bill_table: DenominationTable,
    hopper_enabled: bool,
    hopper_timeout_secs: u64,
    hopper_poll_interval_ms: u64,
    hopper_coin_present: SensorLevel,
    hopper_units: Vec<HopperUnitConfig>,
    session_poll_interval_ms: u64,
    pulse_queue_capacity: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let coin_table = if toml_config.coin.table.is_empty() {
            DenominationTable::default_coins()
        } else {
            DenominationTable::from_entries(&toml_config.coin.table)
        };
        let bill_table = if toml_config.bill.table.is_empty() {
            DenominationTable::default_bills()
        } else {
            DenominationTable::from_entries(&toml_config.bill.table)
        };

        Self {
            site_id: toml_config.site.id,
            coin_enabled: toml_config.coin.enabled,
            coin_pin: toml_config.coin.pin,
            coin_policy: toml_config.coin.policy,
            coin_debounce_ms: toml_config.coin.debounce_ms,
            coin_quiet_period_ms: toml_config.coin.quiet_period_ms,
            coin_max_burst_ms: toml_config.coin.max_burst_ms,
            coin_armed_value: toml_config.coin.armed_value,
            coin_table,
            bill_enabled: toml_config.bill.enabled,
            bill_pin: toml_config.bill.pin,
            bill_debounce_ms: toml_config.bill.debounce_ms,
            bill_quiet_period_ms: toml_config.bill.quiet_period_ms,
            bill_max_burst_ms: toml_config.bill.max_burst_ms,
            bill_table,
            hopper_enabled: toml_config.hopper.enabled,
            hopper_timeout_secs: toml_config.hopper.timeout_secs,
            hopper_poll_interval_ms: toml_config.hopper.poll_interval_ms,
            hopper_coin_present: toml_config.hopper.coin_present,
            hopper_units: toml_config.hopper.units,
            session_poll_interval_ms: toml_config.session.poll_interval_ms,
            pulse_queue_capacity: toml_config.session.pulse_queue_capacity,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| format!("Failed to parse config {source}"))?;
        Ok(Self::from_toml(toml_config, source.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn coin_enabled(&self) -> bool {
        self.coin_enabled
    }

    pub fn coin_pin(&self) -> u8 {
        self.coin_pin
    }

    pub fn coin_policy(&self) -> DecoderPolicy {
        self.coin_policy
    }

    pub fn coin_debounce_ms(&self) -> u64 {
        self.coin_debounce_ms
    }

    pub fn coin_quiet_period_ms(&self) -> u64 {
        self.coin_quiet_period_ms
    }

    pub fn coin_max_burst_ms(&self) -> u64 {
        self.coin_max_burst_ms
    }

    pub fn coin_armed_value(&self) -> Decimal {
        self.coin_armed_value
    }

    pub fn coin_table(&self) -> &DenominationTable {
        &self.coin_table
    }

    pub fn bill_enabled(&self) -> bool {
        self.bill_enabled
    }

    pub fn bill_pin(&self) -> u8 {
        self.bill_pin
    }

    pub fn bill_debounce_ms(&self) -> u64 {
        self.bill_debounce_ms
    }

    pub fn bill_quiet_period_ms(&self) -> u64 {
        self.bill_quiet_period_ms
    }

    pub fn bill_max_burst_ms(&self) -> u64 {
        self.bill_max_burst_ms
    }

    pub fn bill_table(&self) -> &DenominationTable {
        &self.bill_table
    }

    pub fn hopper_enabled(&self) -> bool {
        self.hopper_enabled
    }

    pub fn hopper_timeout_secs(&self) -> u64 {
        self.hopper_timeout_secs
    }

    pub fn hopper_poll_interval_ms(&self) -> u64 {
        self.hopper_poll_interval_ms
    }

    pub fn hopper_coin_present(&self) -> SensorLevel {
        self.hopper_coin_present
    }

    pub fn hopper_units(&self) -> &[HopperUnitConfig] {
        &self.hopper_units
    }

    pub fn session_poll_interval_ms(&self) -> u64 {
        self.session_poll_interval_ms
    }

    pub fn pulse_queue_capacity(&self) -> usize {
        self.pulse_queue_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to pick the coin decoding policy
    pub fn with_coin_policy(mut self, policy: DecoderPolicy) -> Self {
        self.coin_policy = policy;
        self
    }

    /// Builder method for tests to replace the hopper set
    pub fn with_hopper_units(mut self, units: Vec<HopperUnitConfig>) -> Self {
        self.hopper_units = units;
        self
    }
}
