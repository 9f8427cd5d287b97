// ABOUTME: PostgreSQL connection helpers with TLS and retry
// ABOUTME: Spawns the connection task and applies the process-wide certificate policy

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, sanitize_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set whether self-signed server certificates are accepted.
///
/// Only the first call has an effect.
pub fn init_tls_policy(allow_self_signed: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed);
}

fn make_tls() -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if ALLOW_SELF_SIGNED.get().copied().unwrap_or(false) {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a single connection.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = make_tls()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Open a connection, retrying with backoff on failure.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(
        || connect(url),
        |_| true,
        3,
        Duration::from_secs(1),
        "Connect to PostgreSQL",
    )
    .await
    .map_err(|(err, attempts)| err.context(format!("gave up after {} attempt(s)", attempts)))
}
