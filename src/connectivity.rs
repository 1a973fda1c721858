//! Human-readable backend connectivity indicator.
//!
//! Driven by the liveness probe only. It never gates the funnel and its
//! failures never propagate.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::service::ServiceClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    #[default]
    Checking,
    Connected,
    Unreachable,
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checking => write!(f, "Checking backend..."),
            Self::Connected => write!(f, "Backend connected"),
            Self::Unreachable => write!(f, "Backend not reachable"),
        }
    }
}

/// Probe once and translate the outcome into a status.
pub async fn probe_connectivity(client: &dyn ServiceClient) -> ConnectivityStatus {
    match client.probe().await {
        Ok(()) => {
            debug!("Liveness probe succeeded");
            ConnectivityStatus::Connected
        }
        Err(e) => {
            warn!(error = %e, "Liveness probe failed");
            ConnectivityStatus::Unreachable
        }
    }
}

/// Probe every `interval`, publishing the status on a watch channel.
///
/// The task runs until every receiver is dropped.
pub fn spawn_probe_task(
    client: std::sync::Arc<dyn ServiceClient>,
    interval: Duration,
) -> (watch::Receiver<ConnectivityStatus>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(ConnectivityStatus::Checking);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let status = probe_connectivity(client.as_ref()).await;
            if tx.send(status).is_err() {
                break;
            }
        }
    });
    (rx, handle)
}
