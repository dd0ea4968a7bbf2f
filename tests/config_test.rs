//! Integration tests for configuration loading

use kiosk_cash::hal::{Level, Pin};
use kiosk_cash::infra::{Config, DecoderPolicy, SensorLevel};
use kiosk_cash::services::{ChannelConfig, DispenserConfig};
use rust_decimal_macros::dec;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "kiosk-lobby-2"

[coin]
pin = 22
policy = "burst_count"
debounce_ms = 60
quiet_period_ms = 400

[[coin.table]]
pulses = 1
value = 1
label = "1 Peso Coin"

[[coin.table]]
pulses = 5
value = 5
label = "5 Peso Coin"

[bill]
pin = 26
quiet_period_ms = 1200

[hopper]
timeout_secs = 20
coin_present = "low"

[[hopper.units]]
value = 10
label = "10 Peso Coin"
motor_pin = 12
sensor_pin = 13

[session]
poll_interval_ms = 50
pulse_queue_capacity = 64

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "kiosk-lobby-2");
    assert_eq!(config.coin_pin(), 22);
    assert_eq!(config.coin_policy(), DecoderPolicy::BurstCount);
    assert_eq!(config.coin_table().len(), 2);
    assert_eq!(config.coin_table().lookup(5).map(|d| d.value), Some(dec!(5)));
    assert_eq!(config.bill_quiet_period_ms(), 1200);
    // Bill table not given: pulse-per-10 defaults
    assert_eq!(config.bill_table().lookup(2).map(|d| d.value), Some(dec!(20)));
    assert_eq!(config.hopper_coin_present(), SensorLevel::Low);
    assert_eq!(config.hopper_units().len(), 1);
    assert_eq!(config.pulse_queue_capacity(), 64);
    assert_eq!(config.metrics_interval_secs(), 15);
}

#[test]
fn test_config_builds_service_settings() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[coin]
policy = "burst_count"
quiet_period_ms = 400
max_burst_ms = 3000

[hopper]
timeout_secs = 20
poll_interval_ms = 50
coin_present = "low"

[[hopper.units]]
value = 1
motor_pin = 5
sensor_pin = 6
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    let coin = ChannelConfig::coin(&config);
    assert_eq!(coin.pin, Pin(17));
    assert_eq!(coin.quiet_period, Duration::from_millis(400));
    assert_eq!(coin.max_burst, Duration::from_millis(3000));

    let bill = ChannelConfig::bill(&config);
    assert_eq!(bill.policy, DecoderPolicy::BurstCount);
    assert_eq!(bill.quiet_period, Duration::from_millis(1000));

    let dispenser = DispenserConfig::from_config(&config);
    assert_eq!(dispenser.timeout, Duration::from_secs(20));
    assert_eq!(dispenser.poll_interval, Duration::from_millis(50));
    assert_eq!(dispenser.coin_present, Level::Low);
    assert_eq!(dispenser.units[0].denomination.label, "1 coin");
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.coin_pin(), 17);
    assert_eq!(config.bill_pin(), 27);
    assert_eq!(config.coin_policy(), DecoderPolicy::DirectEdge);
    assert_eq!(config.hopper_timeout_secs(), 30);
}

#[test]
fn test_malformed_file_reports_path() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[coin\npin = ").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err}").contains("Failed to parse config"));
}
