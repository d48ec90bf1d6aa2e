use std::path::{Path, PathBuf};

use crate::config::schema::Settings;
use crate::error::ConfigError;
use crate::retry::BackoffStrategy;

const SCHEMA_JSON: &str = include_str!("../../schema/settings-v1.json");

/// Environment variable naming the settings file for the binary.
pub const CONFIG_ENV_VAR: &str = "FILEPROC_CONFIG";

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_settings_from_str(&content)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let settings: Settings = serde_json::from_value(json_value)?;

    validate_settings(&settings)?;

    Ok(settings)
}

/// Loads the file named by `FILEPROC_CONFIG`, or defaults when it is unset.
pub fn load_settings_from_env() -> Result<Settings, ConfigError> {
    match settings_path_from_env() {
        Some(path) => load_settings(path),
        None => Ok(Settings::default()),
    }
}

pub fn settings_path_from_env() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.processing.max_concurrent_jobs == 0 {
        return Err(invalid("processing.max_concurrent_jobs must be at least 1"));
    }

    let batch = &settings.batch;
    if batch.chunk_size == 0 || batch.max_batch_size == 0 {
        return Err(invalid("batch sizes must be at least 1"));
    }
    if batch.chunk_size > batch.max_batch_size {
        return Err(invalid(format!(
            "batch.chunk_size ({}) exceeds batch.max_batch_size ({})",
            batch.chunk_size, batch.max_batch_size
        )));
    }

    let scaling = &settings.scaling;
    if scaling.min_workers == 0 || scaling.min_workers > scaling.max_workers {
        return Err(invalid(format!(
            "scaling.min_workers ({}) must be between 1 and scaling.max_workers ({})",
            scaling.min_workers, scaling.max_workers
        )));
    }
    if !(scaling.scale_down_threshold > 0.0
        && scaling.scale_down_threshold < scaling.scale_up_threshold
        && scaling.scale_up_threshold <= 1.0)
    {
        return Err(invalid(
            "scaling thresholds must satisfy 0 < scale_down_threshold < scale_up_threshold <= 1",
        ));
    }

    let resources = &settings.worker_resources;
    if resources.cpu_cores <= 0.0
        || resources.memory_mb == 0
        || resources.disk_mb == 0
        || resources.network_mbps == 0
    {
        return Err(invalid("worker_resources must all be positive"));
    }

    let retry = &settings.retry;
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if retry.base_delay_seconds < 0.0 || retry.max_delay_seconds < retry.base_delay_seconds {
        return Err(invalid(
            "retry delays must satisfy 0 <= base_delay_seconds <= max_delay_seconds",
        ));
    }
    if retry.strategy == BackoffStrategy::Exponential && retry.backoff_multiplier < 1.0 {
        return Err(invalid("retry.backoff_multiplier must be at least 1.0"));
    }

    if settings.dead_letter.max_queue_size == 0 {
        return Err(invalid("dead_letter.max_queue_size must be at least 1"));
    }

    if let Err(e) = settings
        .logging
        .level
        .parse::<tracing_subscriber::filter::EnvFilter>()
    {
        return Err(invalid(format!(
            "logging.level '{}' is not a valid filter: {}",
            settings.logging.level, e
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{LogFormat, StorageBackend};
    use std::io::Write;

    #[test]
    fn test_empty_object_yields_defaults() {
        let settings = load_settings_from_str("{}").unwrap();
        assert_eq!(settings.processing.max_concurrent_jobs, 10);
        assert_eq!(settings.batch.chunk_size, 50);
        assert_eq!(settings.batch.max_batch_size, 1000);
        assert_eq!(settings.scaling.min_workers, 2);
        assert_eq!(settings.scaling.max_workers, 20);
        assert_eq!(settings.scaling.cooldown_seconds, 300);
        assert_eq!(settings.dead_letter.max_queue_size, 10_000);
        assert_eq!(settings.dead_letter.retention_days, 30);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.storage.backend, StorageBackend::Sqlite);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let settings = load_settings_from_str(
            r#"{
                "processing": { "max_concurrent_jobs": 4 },
                "retry": { "strategy": "linear", "max_attempts": 5 },
                "storage": { "backend": "memory" },
                "logging": { "level": "debug", "format": "json" }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.processing.max_concurrent_jobs, 4);
        assert_eq!(settings.processing.job_timeout_seconds, 3600);
        assert_eq!(settings.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.max_delay_seconds, 300.0);
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_schema_rejects_unknown_section() {
        let err = load_settings_from_str(r#"{"bogus": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_schema_rejects_wrong_type() {
        let err =
            load_settings_from_str(r#"{"processing": {"max_concurrent_jobs": "many"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_min_above_max_workers_rejected() {
        let err = load_settings_from_str(r#"{"scaling": {"min_workers": 30, "max_workers": 20}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("min_workers"));
    }

    #[test]
    fn test_chunk_larger_than_batch_rejected() {
        let err = load_settings_from_str(r#"{"batch": {"chunk_size": 100, "max_batch_size": 10}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let err = load_settings_from_str(
            r#"{"scaling": {"scale_up_threshold": 0.3, "scale_down_threshold": 0.5}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("thresholds"));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = load_settings_from_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseJson(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch": {{"chunk_size": 5}}}}"#).unwrap();
        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.batch.chunk_size, 5);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_settings("/nonexistent/fileproc.json").unwrap_err();
        match err {
            ConfigError::ReadFile { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/fileproc.json"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
