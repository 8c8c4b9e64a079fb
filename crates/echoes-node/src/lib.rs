//! Library of Echoes - ingestion node
//!
//! An anonymous message board whose submissions are placed into layers and
//! rooms by count, and whose whole corpus is closed into an archived epoch
//! once a threshold is reached.
//!
//! # Architecture
//!
//! - **Models**: Epochs, messages, quotas, aggregates and narratives
//! - **Storage**: Transactional store over RocksDB (or memory, for tests)
//! - **Library**: The submission pipeline and read queries
//! - **Epoch**: Threshold closure, narrative and successor creation
//! - **Moments**: Snapshots of each layer an epoch reaches
//! - **API**: HTTP endpoints and the WebSocket event stream
//! - **Admin Socket**: Unix socket for local admin commands (echoes-admin CLI)
//!
//! # Example
//!
//! ```no_run
//! use echoes_node::{EchoesNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = EchoesNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin_socket;
pub mod api;
pub mod clock;
pub mod epoch;
pub mod error;
pub mod events;
pub mod identity;
pub mod library;
pub mod models;
pub mod moments;
pub mod narrative;
pub mod node;
pub mod rate_limit;
pub mod spam_guard;
pub mod stats;
pub mod storage;
pub mod text;
pub mod ws;

pub use error::{Error, Result, SubmitError};
pub use library::{Library, LibraryConfig};
pub use node::{EchoesNode, NodeConfig};
pub use storage::{MemoryStore, RocksStore, Store};
