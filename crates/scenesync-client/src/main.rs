//! # scenesync client
//!
//! Joins a room with an in-memory reference scene and pushes local edits.
//!
//! Each line on stdin is a JSON `SceneDelta`; it is applied to the local
//! scene and pushed to the room. Inbound activity is logged.

use anyhow::{Context, Result};
use scenesync_client::{open_session, ClientConfig};
use scenesync_core::{SceneDelta, SharedScene, TracingErrorSink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting scenesync client"
    );

    // Load configuration
    let config = ClientConfig::from_env()?;
    let client_id = config.client_id.unwrap_or_else(Uuid::new_v4);

    tracing::info!(%client_id, room_id = %config.room_id, host = %config.host, "Client initialized");

    let scene = SharedScene::new();
    let (session, handle) = open_session(&config, scene.clone(), None, Box::new(TracingErrorSink))?;
    let session_task = tokio::spawn(session.run());

    handle.connect().context("Session stopped before connecting")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let change: SceneDelta = match serde_json::from_str(&line) {
                    Ok(change) => change,
                    Err(err) => {
                        tracing::warn!(error = %err, "Ignoring invalid scene delta");
                        continue;
                    }
                };

                match scene.apply_local(&change) {
                    Ok(delta) => {
                        tracing::info!(delta_id = %delta.id, elements = scene.len(), "Local edit applied");
                        handle.push(Some(delta)).context("Session stopped")?;
                    }
                    Err(err) => tracing::warn!(error = %err, "Local edit rejected"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = handle.dispose();
    let client = session_task.await.context("Session task failed")?;

    tracing::info!(
        last_acknowledged_version = client.last_acknowledged_version(),
        queued = client.queued_deltas().len(),
        elements = scene.len(),
        "Client stopped"
    );

    Ok(())
}
