pub mod loader;
pub mod schema;

pub use loader::{
    load_settings, load_settings_from_env, load_settings_from_str, validate_settings,
    CONFIG_ENV_VAR,
};
pub use schema::{
    BatchSettings, CallbackSettings, DeadLetterSettings, LogFormat, LoggingSettings,
    ProcessingSettings, ScalingSettings, Settings, StorageBackend, StorageSettings,
};
