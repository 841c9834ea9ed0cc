use std::sync::Arc;

use rust_decimal_macros::dec;
use tracing::info;

use peermatch::{Config, MemoryHub, NodeRole, Order, Side, SyncService};

/// Demo bootstrap: wires two complete nodes over the in-process transport and
/// walks through a submission, a cross-node match and a cancellation. A real
/// deployment supplies a `PeerTransport` backed by the discovery network and runs
/// one node per process with `Config::from_env()`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let hub = MemoryHub::new();

    let server_config = Config {
        role: NodeRole::Server,
        service_name: "p2p_orderbook".to_string(),
        client_id: "node-server".to_string(),
        ..Config::default()
    };
    let client_config = Config {
        role: NodeRole::Client,
        service_name: "p2p_orderbook".to_string(),
        client_id: "node-client".to_string(),
        ..Config::default()
    };

    let server = SyncService::new(
        server_config.clone(),
        Arc::new(hub.endpoint(&server_config.service_name)),
    );
    let client = SyncService::new(
        client_config.clone(),
        Arc::new(hub.endpoint(&client_config.service_name)),
    );

    server.start().await?;
    client.start().await?;

    // A sell resting on the server's book.
    let sell = Order::new(Side::Sell, dec!(100), dec!(10), "alice")?;
    let result = server.submit_order(sell).await?;
    info!(
        matches = result.matches.len(),
        "server accepted the sell order"
    );

    // Give the client time to settle and pull its initial snapshot.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    let synced = client.book_state();
    info!(
        sells = synced.sell_orders.len(),
        "client synced its book from the swarm"
    );

    // A buy submitted on the client matches the synced sell locally and is
    // broadcast back to the server.
    let buy = Order::new(Side::Buy, dec!(100), dec!(4), "bob")?;
    let result = client.submit_order(buy).await?;
    for record in &result.matches {
        info!(
            amount = %record.amount(),
            price = %record.price(),
            "trade executed on the client node"
        );
    }

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let server_state = server.book_state();
    info!(
        sells = server_state.sell_orders.len(),
        matches = server_state.matches.len(),
        "server book after the broadcast"
    );

    // Cancel the remainder of the sell from the client; the cancellation is
    // broadcast to the rest of the swarm.
    let client_state = client.book_state();
    if let Some(order) = client_state.sell_orders.first() {
        let cancelled = client.cancel_order(order.id()).await?;
        info!(cancelled = cancelled.is_some(), "sell order cancelled");
    }

    client.stop().await?;
    server.stop().await?;
    Ok(())
}
