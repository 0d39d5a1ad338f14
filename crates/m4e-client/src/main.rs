//! Headless client: loads the user's events, then logs every change pushed
//! by the server until interrupted.

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use m4e_client::{ClientConfig, EventsClient};
use m4e_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    m4e_client::init_tracing();

    let config = ClientConfig::from_env();
    info!(server = %config.server_url, user_id = %config.user_id, "Starting {} client", APP_NAME);

    let client = EventsClient::connect(&config)
        .await
        .context("failed to start client session")?;
    let mut changes = client.subscribe();

    match client.list_events().await {
        Ok(events) => {
            for event in &events {
                info!(
                    event_id = %event.id,
                    name = %event.name,
                    members = event.members.len(),
                    locations = event.locations.len(),
                    voting_open = client.is_voting_open(&event.id),
                    "Event"
                );
            }
            info!(count = events.len(), "Events loaded");
        }
        Err(e) => warn!(error_code = e.error_code(), reason = %e.reason(), "Loading events failed"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => info!(?change, "Change"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Change events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.close().await;
    info!("Client stopped");
    Ok(())
}
