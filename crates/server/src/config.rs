//! Layered configuration, modeled on the teacher's `ServerConfig`: a TOML
//! file overridden by `ROOM_ENGINE_`-prefixed environment variables.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

fn default_rust_log() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "compact".to_owned()
}

fn default_max_fetch_prev_events() -> u16 {
    10
}

fn default_room_version() -> String {
    "11".to_owned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    /// This server's own federation name, e.g. `matrix.example.org`.
    pub server_name: String,

    #[serde(default = "default_rust_log")]
    pub rust_log: String,

    /// `"compact"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Cap passed to `get_missing_events`'s backward BFS.
    #[serde(default = "default_max_fetch_prev_events")]
    pub max_fetch_prev_events: u16,

    /// The room version new rooms are created with.
    #[serde(default = "default_room_version")]
    pub room_version: String,
}

impl EngineConfig {
    /// Loads config from `path` (if it exists) layered under
    /// `ROOM_ENGINE_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new();
        if path.as_ref().exists() {
            figment = figment.merge(Toml::file(path.as_ref()));
        }
        figment.merge(Env::prefixed("ROOM_ENGINE_")).extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_env_and_defaults() {
        // SAFETY: test-local, single-threaded access to this one var.
        unsafe { std::env::set_var("ROOM_ENGINE_SERVER_NAME", "test.example") };
        let config = EngineConfig::load("/nonexistent/room-engine.toml").unwrap();
        assert_eq!(config.server_name, "test.example");
        assert_eq!(config.rust_log, "info");
        assert_eq!(config.room_version, "11");
        unsafe { std::env::remove_var("ROOM_ENGINE_SERVER_NAME") };
    }
}
