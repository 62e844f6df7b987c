//! Full-cluster crash and restart.
//!
//! Runs on the caller's task and never overlaps a running partition
//! injector. Every server is stopped by increasing index, the cluster stays
//! down for `settle`, every server is restarted by increasing index from its
//! persisted state, and finally the network is fully reconnected.

use std::time::Duration;

use tracing::info;

use crate::cluster::{ClusterController, ClusterResult};

/// Crash every server, wait `settle`, restart them all and reconnect.
pub async fn crash_and_restart<C: ClusterController>(cluster: &C, settle: Duration) -> ClusterResult<()> {
    let servers = cluster.all_servers();

    info!(servers = servers.len(), "shutting down all servers");
    for &server in &servers {
        cluster.shutdown_server(server).await?;
    }

    tokio::time::sleep(settle).await;

    info!(servers = servers.len(), "restarting all servers");
    for &server in &servers {
        cluster.start_server(server).await?;
    }
    cluster.connect_all().await
}
