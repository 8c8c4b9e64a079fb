//! Echoes Node - the main application entry point.
//!
//! Architecture:
//! - Single daemon process with shared RocksDB storage
//! - HTTP API and event stream for clients
//! - Unix admin socket for local admin ops (echoes-admin CLI)

use crate::admin_socket::AdminSocket;
use crate::api;
use crate::error::{Error, Result};
use crate::library::{Library, LibraryConfig};
use crate::narrative::{HttpNarrator, HttpNarratorConfig, NarrativeService, Narrator, DEFAULT_NARRATIVE_TIMEOUT};
use crate::rate_limit::QuotaPolicy;
use crate::spam_guard::SpamGuardConfig;
use crate::stats::AggregatorConfig;
use crate::storage::RocksStore;
use echoes_layers::{LayerTable, DEFAULT_BABEL_THRESHOLD};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an Echoes node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Admin socket path (for echoes-admin CLI)
    pub admin_socket: PathBuf,

    /// Library tunables
    pub library: LibraryConfig,

    /// External narrative service, if any
    pub narrative: Option<HttpNarratorConfig>,

    /// Hard limit on one narrative call
    pub narrative_timeout: Duration,
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let data_dir =
            PathBuf::from(var("ECHOES_DATA_DIR").unwrap_or_else(|| "./echoes-data".to_string()));
        let api_addr = parse(&lookup, "ECHOES_API_ADDR", "0.0.0.0:8080".parse().ok())?;
        let admin_socket = var("ECHOES_ADMIN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("admin.sock"));

        let layers = match var("ECHOES_LAYERS_FILE") {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("ECHOES_LAYERS_FILE {}: {}", path, e)))?;
                serde_json::from_str::<LayerTable>(&contents)
                    .map_err(|e| Error::Config(format!("ECHOES_LAYERS_FILE {}: {}", path, e)))?
            }
            None => LayerTable::standard(),
        };

        let quota_defaults = QuotaPolicy::default();
        let quota = QuotaPolicy {
            anonymous_limit: parse(&lookup, "ECHOES_ANON_DAILY_QUOTA", Some(quota_defaults.anonymous_limit))?,
            authenticated_limit: parse(
                &lookup,
                "ECHOES_AUTH_DAILY_QUOTA",
                Some(quota_defaults.authenticated_limit),
            )?,
            window: seconds(&lookup, "ECHOES_QUOTA_WINDOW_SECS", quota_defaults.window)?,
        };

        let spam_defaults = SpamGuardConfig::default();
        let spam = SpamGuardConfig {
            max_attempts: parse(&lookup, "ECHOES_SPAM_MAX_ATTEMPTS", Some(spam_defaults.max_attempts))?,
            window: seconds(&lookup, "ECHOES_SPAM_WINDOW_SECS", spam_defaults.window)?,
            block: seconds(&lookup, "ECHOES_SPAM_BLOCK_SECS", spam_defaults.block)?,
        };

        let stats = AggregatorConfig {
            utc_offset_minutes: parse(&lookup, "ECHOES_STATS_UTC_OFFSET_MINUTES", Some(0))?,
            ..AggregatorConfig::default()
        };
        if stats.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(Error::Config("ECHOES_STATS_UTC_OFFSET_MINUTES out of range".into()));
        }

        let threshold: u64 = parse(&lookup, "ECHOES_BABEL_THRESHOLD", Some(DEFAULT_BABEL_THRESHOLD))?;
        if threshold == 0 {
            return Err(Error::Config("ECHOES_BABEL_THRESHOLD must be positive".into()));
        }

        let address_salt = match var("ECHOES_IP_SALT") {
            Some(salt) => salt,
            None => {
                tracing::warn!("ECHOES_IP_SALT not set, using the default salt");
                LibraryConfig::default().address_salt
            }
        };

        let trust_proxy_headers = parse(&lookup, "ECHOES_TRUST_PROXY_HEADERS", Some(true))?;
        if !trust_proxy_headers {
            tracing::info!("Ignoring proxy headers, callers are identified by socket address");
        }

        let narrative = var("ECHOES_NARRATIVE_URL").map(|endpoint| HttpNarratorConfig {
            endpoint,
            api_key: var("ECHOES_NARRATIVE_API_KEY"),
            model: var("ECHOES_NARRATIVE_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        });
        let narrative_timeout = Duration::from_millis(parse(
            &lookup,
            "ECHOES_NARRATIVE_TIMEOUT_MS",
            Some(DEFAULT_NARRATIVE_TIMEOUT.as_millis() as u64),
        )?);

        Ok(Self {
            data_dir,
            api_addr,
            admin_socket,
            library: LibraryConfig {
                threshold,
                layers,
                quota,
                spam,
                stats,
                address_salt,
                trust_proxy_headers,
            },
            narrative,
            narrative_timeout,
        })
    }
}

/// Parse a variable, falling back to `default` when unset.
fn parse<F, T>(lookup: &F, name: &str, default: Option<T>) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name).filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", name, e))),
        None => default.ok_or_else(|| Error::Config(format!("{} is required", name))),
    }
}

fn seconds<F>(lookup: &F, name: &str, default: chrono::Duration) -> Result<chrono::Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: i64 = parse(lookup, name, Some(default.num_seconds()))?;
    if secs <= 0 {
        return Err(Error::Config(format!("{} must be positive", name)));
    }
    Ok(chrono::Duration::seconds(secs))
}

/// An Echoes node instance.
pub struct EchoesNode {
    library: Arc<Library>,
    config: NodeConfig,
}

impl EchoesNode {
    /// Open storage and assemble the library.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        // Ensure data directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(RocksStore::open(config.data_dir.join("db"))?);

        let primary: Option<Arc<dyn NarrativeService>> = match &config.narrative {
            Some(narrative) => {
                let client = HttpNarrator::new(narrative.clone(), config.narrative_timeout)
                    .map_err(|e| Error::Config(format!("narrative client: {}", e)))?;
                tracing::info!("Narrative service: {}", narrative.endpoint);
                Some(Arc::new(client))
            }
            None => {
                tracing::info!("No narrative service configured, using the template");
                None
            }
        };

        let library = Library::builder(store)
            .config(config.library.clone())
            .narrator(Narrator::new(primary, config.narrative_timeout))
            .build()?;

        Ok(Self {
            library: Arc::new(library),
            config,
        })
    }

    /// Get the shared library (for API handlers).
    pub fn library(&self) -> Arc<Library> {
        Arc::clone(&self.library)
    }

    /// Run the node (finishes pending closures, starts admin socket and HTTP server).
    pub async fn run(self) -> Result<()> {
        tracing::info!("Echoes node starting");
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Admin: {:?}", self.config.admin_socket);
        tracing::info!("  Data: {:?}", self.config.data_dir);
        tracing::info!("  Threshold: {}", self.config.library.threshold);

        if let Some(outcome) = self.library.resume_pending_closure().await? {
            tracing::info!("Pending closure at boot: {:?}", outcome);
        }

        // Start admin socket server in background
        let admin_socket = AdminSocket::new(self.library(), self.config.admin_socket.clone());
        tokio::spawn(async move {
            if let Err(e) = admin_socket.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });

        // Build HTTP API
        let app = api::build_router(self.library());

        // Start HTTP server
        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<NodeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./echoes-data"));
        assert_eq!(config.admin_socket, PathBuf::from("./echoes-data/admin.sock"));
        assert_eq!(config.api_addr.port(), 8080);
        assert_eq!(config.library.threshold, DEFAULT_BABEL_THRESHOLD);
        assert_eq!(config.library.quota, QuotaPolicy::default());
        assert!(config.narrative.is_none());
        assert_eq!(config.narrative_timeout, DEFAULT_NARRATIVE_TIMEOUT);
        assert!(config.library.trust_proxy_headers);
    }

    #[test]
    fn proxy_headers_can_be_distrusted() {
        let distrusting = config(&[("ECHOES_TRUST_PROXY_HEADERS", "false")]).unwrap();
        assert!(!distrusting.library.trust_proxy_headers);
        assert!(matches!(
            config(&[("ECHOES_TRUST_PROXY_HEADERS", "sometimes")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn variables_override_defaults() {
        let config = config(&[
            ("ECHOES_BABEL_THRESHOLD", "5"),
            ("ECHOES_ANON_DAILY_QUOTA", "2"),
            ("ECHOES_QUOTA_WINDOW_SECS", "60"),
            ("ECHOES_NARRATIVE_URL", "http://localhost:9999/v1/chat/completions"),
            ("ECHOES_NARRATIVE_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.library.threshold, 5);
        assert_eq!(config.library.quota.anonymous_limit, 2);
        assert_eq!(config.library.quota.window, chrono::Duration::seconds(60));
        assert_eq!(config.narrative_timeout, Duration::from_millis(250));
        assert_eq!(config.narrative.unwrap().model, "gpt-4o-mini");
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for vars in [
            [("ECHOES_BABEL_THRESHOLD", "many")],
            [("ECHOES_BABEL_THRESHOLD", "0")],
            [("ECHOES_API_ADDR", "not an address")],
            [("ECHOES_SPAM_WINDOW_SECS", "-5")],
            [("ECHOES_LAYERS_FILE", "/nonexistent/layers.json")],
        ] {
            assert!(matches!(config(&vars), Err(Error::Config(_))), "{:?}", vars);
        }
    }

    #[test]
    fn layers_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layers.json");
        std::fs::write(
            &path,
            r#"[
                {"index": 1, "name": "Near", "minCount": 0, "maxCount": 3, "roomCount": 1, "roomCapacity": 3},
                {"index": 2, "name": "Far", "minCount": 3, "maxCount": null, "roomCount": 2, "roomCapacity": 2}
            ]"#,
        )
        .unwrap();
        let path = path.to_string_lossy().to_string();
        {
            let config = config(&[("ECHOES_LAYERS_FILE", path.as_str())]).unwrap();
            assert_eq!(config.library.layers.len(), 2);
        }

        std::fs::write(&path, r#"[{"index": 1, "name": "Gap", "minCount": 5, "maxCount": null, "roomCount": 1, "roomCapacity": 1}]"#).unwrap();
        assert!(matches!(
            config(&[("ECHOES_LAYERS_FILE", path.as_str())]),
            Err(Error::Config(_))
        ));
    }
}
