#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps
)]

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::AsapClient;
pub use config::Config;
pub use error::TransportError;
pub use protocol::envelope::Envelope;
pub use server::AsapServer;
pub use transport::breaker::BreakerRegistry;

use tracing_subscriber::EnvFilter;

/// Initialize tracing with env-filter support (`RUST_LOG`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
