//! Health monitor import configuration loading and validation.
//!
//! This crate provides:
//! - The instrument registry read from the settings JSON
//! - Typed import and store configuration records
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation with per-field errors

pub mod error;
pub mod import;
pub mod resolve;
pub mod settings;
pub mod store;
pub mod validate;

pub use error::{ConfigError, Result};
pub use import::{EnumStrategy, ImportConfig, LoadMode, RowErrorPolicy};
pub use resolve::{resolve_config, ConfigPaths, ConfigSource, HmConfig};
pub use settings::InstrumentRegistry;
pub use store::StoreConfig;
pub use validate::ValidationError;
