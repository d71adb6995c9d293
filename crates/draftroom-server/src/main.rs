// Draft room server entry point.
//
// Startup sequence:
// 1. Initialize tracing (stderr)
// 2. Load config
// 3. Open database
// 4. Spawn the hub
// 5. Bind the listener and serve until Ctrl+C
// 6. Cleanup on exit

use std::sync::Arc;

use anyhow::Context;
use draftroom_core::config;
use draftroom_core::db::Database;
use draftroom_core::hub::Hub;
use draftroom_core::ws_server;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Draft room server starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: listen={}, outbound queue={} frames, pong wait={}s",
        config.bind_addr(),
        config.connection.outbound_capacity,
        config.connection.pong_wait_secs
    );

    // 3. Open database
    let db_path = &config.database.path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let db = Database::open(&db_path.to_string_lossy()).context("failed to open database")?;
    info!("Database opened at {}", db_path.display());

    // 4. Spawn the hub
    let (hub, hub_task) = Hub::spawn(Arc::new(db), config.hub.event_capacity);

    // 5. Bind the listener and serve until Ctrl+C
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    let settings = config.connection_settings();

    tokio::select! {
        result = ws_server::run(listener, hub, settings) => {
            if let Err(e) = result {
                error!("WebSocket server error: {}", e);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("Ctrl+C received, shutting down");
        }
    }

    // 6. Cleanup: connection tasks still hold hub handles, so stop the hub
    // directly rather than waiting for it to drain.
    hub_task.abort();

    info!("Draft room server shut down");
    Ok(())
}

/// Initialize tracing to stderr. `RUST_LOG` overrides the default filter.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("draftroom=info,draftroom_core=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
