//! Tests for batch queue configuration parsing.

use std::time::Duration;

use color_eyre::eyre::Result;

use super::*;

#[test]
fn parse_full_config() -> Result<()> {
    let _init_guard = batch_queue_test::init();

    let config: Config = toml::from_str(
        r#"
        batch_size = 16
        timeout = "250ms"
        max_concurrent_batches = 2
        shutdown_policy = "reject"
        "#,
    )?;

    assert_eq!(
        config,
        Config {
            batch_size: 16,
            timeout: Duration::from_millis(250),
            max_concurrent_batches: 2,
            shutdown_policy: ShutdownPolicy::Reject,
        }
    );

    Ok(())
}

#[test]
fn missing_fields_use_defaults() -> Result<()> {
    let _init_guard = batch_queue_test::init();

    let config: Config = toml::from_str(r#"timeout = "2s""#)?;

    assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    assert_eq!(config.timeout, Duration::from_secs(2));
    assert_eq!(config.max_concurrent_batches, 1);
    assert_eq!(config.shutdown_policy, ShutdownPolicy::Drain);

    Ok(())
}

#[test]
fn unknown_fields_are_rejected() {
    let _init_guard = batch_queue_test::init();

    let result: Result<Config, _> = toml::from_str("max_batch_weight = 3");

    assert!(result.is_err(), "unexpected field should be rejected");
}

#[test]
fn zero_limits_are_clamped() {
    let _init_guard = batch_queue_test::init();

    let config = Config {
        batch_size: 0,
        max_concurrent_batches: 0,
        ..Config::default()
    }
    .clamped();

    assert_eq!(config.batch_size, 1);
    assert_eq!(config.max_concurrent_batches, 1);
}
