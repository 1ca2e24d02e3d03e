//! Configuration loading, validation and env substitution.
//!
//! Config files: `campusline.toml`, `campusline.yaml`, or `campusline.json`
//! Searched in `./` then the user config directory.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, data_dir, discover_and_load, find_or_default_config_path, load_config,
        save_config, set_config_dir, set_data_dir, to_toml_string,
    },
    schema::{BrokerConfig, CampuslineConfig, PairingConfig, ServerConfig, SidecarConfig},
    validate::{Diagnostic, Severity, ValidationResult},
};
