//! Configuration for the gatelink gateway client.
//!
//! Config files (`gatelink.toml`, `.yaml`/`.yml` or `.json`) are looked up in
//! the working directory, then the platform config directory. `GATELINK_URL`,
//! `GATELINK_TOKEN` and `GATELINK_PASSWORD` override file values.

pub mod error;
pub mod load;
pub mod schema;

pub use {
    error::{Error, Result},
    load::{
        ConfigFormat, apply_env_overrides, discover_and_load, find_config_file, load_from_path,
        parse_str,
    },
    schema::*,
};
