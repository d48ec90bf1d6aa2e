//! Table-driven tests for settings loading and validation.
//!
//! Tests cover inline JSON, files on disk and the `FILEPROC_CONFIG`
//! environment variable.

mod common;

use assert_fs::prelude::*;
use serial_test::serial;

use fileproc::config::{
    load_settings, load_settings_from_env, load_settings_from_str, StorageBackend, CONFIG_ENV_VAR,
};
use fileproc::retry::BackoffStrategy;

/// Represents a single settings loading test case.
struct SettingsTestCase {
    /// Test case name for identification.
    name: &'static str,
    /// The settings JSON content to test.
    settings_json: &'static str,
    /// Whether loading should succeed.
    should_succeed: bool,
    /// Expected error substring (if should_succeed is false).
    expected_error: Option<&'static str>,
}

const SETTINGS_TESTS: &[SettingsTestCase] = &[
    SettingsTestCase {
        name: "empty",
        settings_json: "{}",
        should_succeed: true,
        expected_error: None,
    },
    SettingsTestCase {
        name: "valid_full",
        settings_json: r#"{
            "processing": {
                "max_concurrent_jobs": 8,
                "job_timeout_seconds": 600,
                "backoff_millis": 50,
                "work_dir": "/var/lib/fileproc/work",
                "files_dir": "/var/lib/fileproc/files"
            },
            "batch": { "chunk_size": 25, "max_batch_size": 500, "cleanup_after_hours": 12 },
            "scaling": {
                "enabled": true,
                "min_workers": 1,
                "max_workers": 8,
                "scale_up_threshold": 0.9,
                "scale_down_threshold": 0.2,
                "cooldown_seconds": 60,
                "heartbeat_timeout_seconds": 120,
                "monitor_interval_seconds": 15
            },
            "worker_resources": { "cpu_cores": 4.0, "memory_mb": 8192, "disk_mb": 20480, "network_mbps": 1000 },
            "retry": {
                "max_attempts": 5,
                "strategy": "exponential",
                "base_delay_seconds": 2.0,
                "max_delay_seconds": 120.0,
                "backoff_multiplier": 3.0,
                "jitter": false,
                "retry_on": ["ConnectionError", "TimeoutError"]
            },
            "dead_letter": {
                "max_queue_size": 500,
                "retention_days": 7,
                "auto_retry_interval_hours": 6,
                "retry_later_delay_seconds": 3600,
                "sweep_interval_seconds": 600,
                "notify_url": "https://ops.example.com/dlq"
            },
            "storage": { "backend": "sqlite", "path": "/var/lib/fileproc/fileproc.db" },
            "logging": { "level": "fileproc=debug,info", "format": "json" },
            "callbacks": { "timeout_seconds": 10 }
        }"#,
        should_succeed: true,
        expected_error: None,
    },
    SettingsTestCase {
        name: "unknown_top_level_key",
        settings_json: r#"{ "workers": 4 }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    SettingsTestCase {
        name: "unknown_strategy",
        settings_json: r#"{ "retry": { "strategy": "fibonacci" } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    SettingsTestCase {
        name: "zero_concurrency",
        settings_json: r#"{ "processing": { "max_concurrent_jobs": 0 } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    SettingsTestCase {
        name: "min_workers_above_max",
        settings_json: r#"{ "scaling": { "min_workers": 10, "max_workers": 4 } }"#,
        should_succeed: false,
        expected_error: Some("scaling.min_workers"),
    },
    SettingsTestCase {
        name: "chunk_above_batch_limit",
        settings_json: r#"{ "batch": { "chunk_size": 80, "max_batch_size": 40 } }"#,
        should_succeed: false,
        expected_error: Some("batch.chunk_size"),
    },
    SettingsTestCase {
        name: "base_delay_above_max_delay",
        settings_json: r#"{ "retry": { "base_delay_seconds": 10.0, "max_delay_seconds": 5.0 } }"#,
        should_succeed: false,
        expected_error: Some("retry delays"),
    },
    SettingsTestCase {
        name: "bad_log_filter",
        settings_json: r#"{ "logging": { "level": "fileproc=loud" } }"#,
        should_succeed: false,
        expected_error: Some("logging.level"),
    },
    SettingsTestCase {
        name: "retention_beyond_ten_years",
        settings_json: r#"{ "dead_letter": { "retention_days": 18446744073709551615 } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    SettingsTestCase {
        name: "cleanup_window_beyond_ten_years",
        settings_json: r#"{ "batch": { "cleanup_after_hours": 100000 } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    SettingsTestCase {
        name: "not_json",
        settings_json: "processing: 4",
        should_succeed: false,
        expected_error: Some("Failed to parse config JSON"),
    },
];

#[test]
fn test_settings_loading() {
    for test_case in SETTINGS_TESTS {
        let result = load_settings_from_str(test_case.settings_json);

        if test_case.should_succeed {
            assert!(
                result.is_ok(),
                "Test '{}': Expected success but got error: {:?}",
                test_case.name,
                result.err()
            );
        } else {
            assert!(
                result.is_err(),
                "Test '{}': Expected error but got success",
                test_case.name
            );

            if let Some(expected_error) = test_case.expected_error {
                let error_msg = result.err().unwrap().to_string();
                assert!(
                    error_msg.contains(expected_error),
                    "Test '{}': Expected error containing '{}', got '{}'",
                    test_case.name,
                    expected_error,
                    error_msg
                );
            }
        }
    }
}

#[test]
fn test_full_settings_field_values() {
    let full = SETTINGS_TESTS
        .iter()
        .find(|t| t.name == "valid_full")
        .unwrap();
    let settings = load_settings_from_str(full.settings_json).unwrap();

    assert_eq!(settings.processing.max_concurrent_jobs, 8);
    assert_eq!(settings.batch.chunk_size, 25);
    assert_eq!(settings.scaling.max_workers, 8);
    assert_eq!(settings.worker_resources.memory_mb, 8192);
    assert_eq!(settings.retry.strategy, BackoffStrategy::Exponential);
    assert_eq!(settings.retry.retry_on, vec!["ConnectionError", "TimeoutError"]);
    assert!(!settings.retry.jitter);
    assert_eq!(settings.dead_letter.retention_days, 7);
    assert_eq!(
        settings.dead_letter.notify_url.as_deref(),
        Some("https://ops.example.com/dlq")
    );
    assert_eq!(settings.storage.backend, StorageBackend::Sqlite);
    assert_eq!(settings.callbacks.timeout_seconds, 10);
}

#[test]
fn test_load_settings_from_file() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("fileproc.json");
    file.write_str(r#"{ "storage": { "backend": "memory" }, "batch": { "chunk_size": 3 } }"#)
        .unwrap();

    let settings = load_settings(file.path()).unwrap();
    assert_eq!(settings.storage.backend, StorageBackend::Memory);
    assert_eq!(settings.batch.chunk_size, 3);
}

#[test]
#[serial]
fn test_env_var_names_settings_file() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("settings.json");
    file.write_str(r#"{ "processing": { "max_concurrent_jobs": 3 } }"#)
        .unwrap();

    std::env::set_var(CONFIG_ENV_VAR, file.path());
    let result = load_settings_from_env();
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(result.unwrap().processing.max_concurrent_jobs, 3);
}

#[test]
#[serial]
fn test_unset_env_var_yields_defaults() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let settings = load_settings_from_env().unwrap();
    assert_eq!(settings.processing.max_concurrent_jobs, 10);
}

#[test]
#[serial]
fn test_env_var_pointing_nowhere_is_an_error() {
    std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/fileproc.json");
    let result = load_settings_from_env();
    std::env::remove_var(CONFIG_ENV_VAR);

    let err = result.unwrap_err().to_string();
    assert!(err.contains("/nonexistent/fileproc.json"));
}
