//! `tracing-subscriber` wiring, driven by `EngineConfig::rust_log` /
//! `log_format` exactly as the teacher's binary drives its own subscriber
//! from `ServerConfig::rust_log` / `log_format`.

use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;

pub fn init(config: &EngineConfig) {
    let filter = EnvFilter::try_new(&config.rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().compact().with_env_filter(filter).init();
    }
}
