// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod broadcast;
pub mod classifier;
pub mod config;
pub mod decision;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod pipeline;
pub mod quota;
pub mod signal;
pub mod source;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::config::{Deployment, PipelineConfig};
pub use crate::error::{ClassifyError, DeliveryError, PipelineError, StoreError};
pub use crate::model::{Decision, DecisionKind, RawItem, Signal};
pub use crate::pipeline::{Pipeline, RunOutcome, RunReport};
pub use crate::store::{MemoryStore, SignalStore, SqliteStore};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log targets used by the components; all default to `info`.
const LOG_TARGETS: &[&str] = &[
    "incident_signals",
    "pipeline",
    "classifier",
    "broadcast",
    "dedup",
    "filter",
    "lock",
    "source",
    "store",
    "config",
];

fn default_log_directives() -> String {
    let mut d: Vec<String> = LOG_TARGETS.iter().map(|t| format!("{t}=info")).collect();
    d.push("warn".to_string());
    d.join(",")
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to
/// JSON lines. Safe to call more than once (later calls are no-ops).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_directives()));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
