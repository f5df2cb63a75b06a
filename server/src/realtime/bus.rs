//! Cross-instance fan-out over Postgres `LISTEN/NOTIFY`. Every instance hears
//! every delivery, itself included, and hands it to the sockets it owns.

use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgListener, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Delivery, Hub};

pub const CHANNEL: &str = "omnichat_realtime";
/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
const MAX_PAYLOAD: usize = 7900;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("notify failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("delivery does not serialize: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery of {0} bytes exceeds the notify limit")]
    TooLarge(usize),
}

pub async fn notify(pool: &PgPool, delivery: &Delivery) -> Result<(), BusError> {
    let payload = serde_json::to_string(delivery)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(BusError::TooLarge(payload.len()));
    }
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANNEL)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Relays notifications to `hub` until cancelled, reconnecting on failure.
pub async fn listen(pool: PgPool, hub: Arc<Hub>, shutdown: CancellationToken) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "fan-out listener connect failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
                }
            }
        };
        if let Err(err) = listener.listen(CHANNEL).await {
            error!(error = %err, "fan-out listen failed");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
            }
        }
        info!(channel = CHANNEL, "fan-out listener started");

        loop {
            let notification = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = listener.recv() => received,
            };
            match notification {
                Ok(notification) => {
                    match serde_json::from_str::<Delivery>(notification.payload()) {
                        Ok(delivery) => {
                            hub.deliver_local(&delivery);
                        }
                        Err(err) => warn!(error = %err, "dropping malformed fan-out payload"),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "fan-out listener lost connection");
                    break;
                }
            }
        }
    }
}
