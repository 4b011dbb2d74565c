//! Connection server
//!
//! Serves the framed request protocol with the echo command handler.
//! Ctrl-C runs the two-phase shutdown.
//!
//! ## Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | CONN_CONFIG | - | Optional TOML file, overridden by the `CONN_*` variables |
//! | CONN_PORT | 1523 | Listen port |
//! | CONN_HA_STATE | idle | Initial HA role |
//! | CONN_LOG_FORMAT | text | `text` or `json` |
//! | RUST_LOG | info | Log filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use conn_server::observability::init_tracing;
use conn_server::{Handlers, HaState, Server, ServerConfig, TransactionTable};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match std::env::var("CONN_CONFIG") {
        Ok(path) => ServerConfig::from_file(&path)?,
        Err(_) => {
            let config = ServerConfig::from_env();
            config.validate()?;
            config
        }
    };
    init_tracing(config.log_format);

    info!(
        addr = %config.listen_addr(),
        slots = config.registry.capacity,
        max_clients = config.admission.max_clients,
        rules = config.admission.rules.len(),
        ha = %config.ha.initial_state,
        "starting connection server"
    );

    let initial_state = config.ha.initial_state;
    let server = Server::new(config, Arc::new(TransactionTable::new()), Handlers::default());

    // An idle server promotes itself; a configured role is left alone.
    if initial_state == HaState::Idle {
        if let Err(e) = server.ha().change_state(HaState::Active, false, true).await {
            error!(error = %e, "failed to enter active state");
        }
    }

    let serving = tokio::spawn(server.clone().serve());

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    let report = server.shutdown().await;
    if !report.is_clean() {
        error!(?report, "shutdown forced workers to terminate");
    }

    match serving.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
