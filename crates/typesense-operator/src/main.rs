use futures::StreamExt;
use kube::Client;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use typesense_operator::cluster_controller as cluster;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("typesense-operator starting up");

    let client = Client::try_default().await?;

    let ctx = Arc::new(cluster::Ctx::new(client.clone()));
    let cluster_controller = cluster::controller(client)
        .run(cluster::reconcile, cluster::error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "cluster reconcile error");
            }
        });

    tokio::select! {
        _ = cluster_controller => {},
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    Ok(())
}
