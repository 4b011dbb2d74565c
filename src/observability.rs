//! Tracing setup.
//!
//! Level filtering follows `RUST_LOG` (default `info`). `LogFormat::Json`
//! switches the fmt layer to one JSON object per line.

use crate::admission::ClientClass;
use crate::config::LogFormat;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Later calls are ignored.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let res = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Span wrapping everything a connection handler does.
pub fn connection_span(index: usize, client_id: u32, class: ClientClass, peer: &str) -> Span {
    tracing::info_span!("conn", index, client_id, class = %class, peer)
}
