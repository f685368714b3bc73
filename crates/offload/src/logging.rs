//! Tracing setup shared by host programs and the worker binary.
//!
//! - `RUST_LOG` wins when set
//! - otherwise `OFFLOAD_LOG` picks the level for this crate (default `info`)
//! - `LOG_FORMAT=json` switches to JSON lines
//!
//! Output always goes to stderr; worker stdout belongs to the worker's code.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const ENV_LOG_LEVEL: &str = "OFFLOAD_LOG";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

fn base_level(raw: Option<&str>) -> &'static str {
    match raw.map(str::trim) {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_directives(level: &str) -> String {
    format!("offload={level},offload_worker={level}")
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(ENV_LOG_LEVEL).ok().as_deref());
        EnvFilter::new(default_directives(level))
    };

    let use_json = std::env::var(ENV_LOG_FORMAT).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
