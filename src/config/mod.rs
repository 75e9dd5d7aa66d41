//! Configuration
//!
//! TOML-backed configuration with defaults for every field, so a file only
//! needs the values it overrides.

mod schema;
mod store;

pub use schema::{AppConfig, ReconnectConfig, SessionConfig};
pub use store::ConfigStore;
