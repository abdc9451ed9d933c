//! Wires the TTL cache, block store, and a NATS route together and runs
//! until interrupted. A smoke-test harness, not a production entry point —
//! no HTTP/gRPC server lives here.

use std::sync::Arc;
use std::time::Duration;

use confluo_core::{Join, RouteConfig};
use confluo_server::blockstore::BlockStore;
use confluo_server::config::Config;
use confluo_server::route::{Envelope, NatsBroker, Route};
use confluo_server::TtlCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(?config, "starting confluo-demo");

    let mut cache = TtlCache::new(config.base_ttl, config.cleanup_interval);

    let block_store = Arc::new(BlockStore::new(
        vec!["orderId".to_string()],
        Join,
        config.block_count_soft_limit,
        config.block_part_max_join_count,
        config.block_window_ttl,
        config.block_part_max_age,
    ));

    let route_config = RouteConfig {
        selector: "orders/created".to_string(),
        subject: "demo.orders.created".to_string(),
        url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
        mode: confluo_core::Mode::Push,
        queue: None,
        name: None,
        max_ack_pending: None,
        ack_wait: None,
        batch_size: None,
    };
    let route = Arc::new(Route::new(Arc::new(NatsBroker::new()), route_config, config.channel_ttl));

    let store_for_callback = Arc::clone(&block_store);
    route
        .subscribe(Arc::new(move |envelope: Envelope| {
            let block_store = Arc::clone(&store_for_callback);
            Box::pin(async move {
                let Some(record) = envelope.record() else {
                    tracing::warn!("dropping envelope with unparseable payload");
                    return;
                };
                if let Err(err) = block_store.add_data("orders", record, |joined| {
                    tracing::info!(?joined, "joined record");
                    Ok(())
                }) {
                    tracing::warn!(error = %err, "add_data failed");
                }
                let _ = envelope.ack().await;
            })
        }))
        .await?;

    tracing::info!(idle = block_store.is_idle(Duration::from_secs(3600)), "listening, waiting for Ctrl-C");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    route.disconnect().await?;
    cache.close().await;
    Ok(())
}
