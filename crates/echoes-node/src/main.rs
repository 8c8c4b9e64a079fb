//! Echoes Node binary
//!
//! Ingestion node for the Library of Echoes.

use echoes_node::{EchoesNode, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echoes_node=info,echoes_layers=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Echoes Node");

    let config = NodeConfig::from_env()?;

    // Create and run node
    let node = EchoesNode::new(config).await?;
    node.run().await?;

    Ok(())
}
