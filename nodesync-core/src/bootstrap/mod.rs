//! Process bootstrap helpers shared by the binary

pub mod config;

pub use config::{load_config, resolve_config_path};
