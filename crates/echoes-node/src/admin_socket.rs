//! Unix socket server for admin commands.
//!
//! Newline-delimited JSON: one [`AdminCommand`] per line in, one
//! [`AdminResponse`] per line out. Used by the `echoes-admin` CLI.

use crate::epoch::ClosureOutcome;
use crate::error::Result;
use crate::library::Library;
use crate::models::{EpochId, NarrativeDraft};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Admin command sent over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Add an admin
    AddAdmin { public_key: String },
    /// Remove an admin
    RemoveAdmin { public_key: String },
    /// List all admins
    ListAdmins,
    /// Check if a key is admin
    IsAdmin { public_key: String },
    /// Current epoch state
    State,
    /// Close an epoch with a supplied narrative
    CloseEpoch {
        epoch_id: EpochId,
        narrative: NarrativeDraft,
        #[serde(default)]
        by: Option<String>,
    },
    /// Finish an interrupted closure
    ResumeClosure,
    /// Ping (health check)
    Ping,
}

/// Response from admin command.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    List { items: Vec<String> },
    Bool { value: bool },
    Json { value: serde_json::Value },
    Pong,
}

impl AdminResponse {
    fn error(e: impl ToString) -> Self {
        AdminResponse::Error {
            error: e.to_string(),
        }
    }
}

/// Admin socket server.
pub struct AdminSocket {
    library: Arc<Library>,
    socket_path: PathBuf,
}

impl AdminSocket {
    /// Create a new admin socket server.
    pub fn new(library: Arc<Library>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            library,
            socket_path: socket_path.into(),
        }
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        // Remove existing socket file if present
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let library = Arc::clone(&self.library);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, library).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, library: Arc<Library>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => execute_command(cmd, &library).await,
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

fn is_public_key(candidate: &str) -> bool {
    candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Run one command against the library.
pub async fn execute_command(cmd: AdminCommand, library: &Library) -> AdminResponse {
    let store = library.store();
    match cmd {
        AdminCommand::AddAdmin { public_key } | AdminCommand::RemoveAdmin { public_key }
            if !is_public_key(&public_key) =>
        {
            AdminResponse::error(format!("Not a hex Ed25519 public key: {}", public_key))
        }

        AdminCommand::AddAdmin { public_key } => {
            let public_key = public_key.to_lowercase();
            match store.set_admin(&public_key, true) {
                Ok(()) => {
                    tracing::info!("Added admin: {}", public_key);
                    AdminResponse::Ok {
                        message: format!("Added admin: {}", public_key),
                    }
                }
                Err(e) => AdminResponse::error(e),
            }
        }

        AdminCommand::RemoveAdmin { public_key } => {
            let public_key = public_key.to_lowercase();
            match store.set_admin(&public_key, false) {
                Ok(()) => {
                    tracing::info!("Removed admin: {}", public_key);
                    AdminResponse::Ok {
                        message: format!("Removed admin: {}", public_key),
                    }
                }
                Err(e) => AdminResponse::error(e),
            }
        }

        AdminCommand::ListAdmins => match store.list_admins() {
            Ok(admins) => AdminResponse::List { items: admins },
            Err(e) => AdminResponse::error(e),
        },

        AdminCommand::IsAdmin { public_key } => match store.is_admin(&public_key.to_lowercase()) {
            Ok(is_admin) => AdminResponse::Bool { value: is_admin },
            Err(e) => AdminResponse::error(e),
        },

        AdminCommand::State => match library
            .system_state()
            .and_then(|state| Ok(serde_json::to_value(state)?))
        {
            Ok(value) => AdminResponse::Json { value },
            Err(e) => AdminResponse::error(e),
        },

        AdminCommand::CloseEpoch {
            epoch_id,
            narrative,
            by,
        } => {
            let by = by.unwrap_or_else(|| "admin-socket".to_string());
            match library.supply_manual_narrative(epoch_id, narrative, &by).await {
                Ok(outcome) => closure_response(epoch_id, outcome),
                Err(e) => AdminResponse::error(e),
            }
        }

        AdminCommand::ResumeClosure => match library.resume_pending_closure().await {
            Ok(Some(outcome)) => closure_response(0, outcome),
            Ok(None) => AdminResponse::Ok {
                message: "No closure pending".to_string(),
            },
            Err(e) => AdminResponse::error(e),
        },

        AdminCommand::Ping => AdminResponse::Pong,
    }
}

fn closure_response(epoch_id: EpochId, outcome: ClosureOutcome) -> AdminResponse {
    match outcome {
        ClosureOutcome::Closed { closed, successor } => AdminResponse::Ok {
            message: format!("Closed {}, {} is open", closed.name, successor.name),
        },
        ClosureOutcome::InProgress => AdminResponse::error("Closure already in progress"),
        ClosureOutcome::AlreadyClosed => AdminResponse::error("Epoch already closed"),
        ClosureOutcome::BelowThreshold { total, threshold } => {
            AdminResponse::error(format!("Below threshold: {}/{}", total, threshold))
        }
        ClosureOutcome::NotFound => AdminResponse::error(format!("No epoch {}", epoch_id)),
    }
}

/// Default socket path.
pub fn default_socket_path() -> PathBuf {
    let data_dir = std::env::var("ECHOES_DATA_DIR").unwrap_or_else(|_| "./echoes-data".to_string());
    PathBuf::from(data_dir).join("admin.sock")
}
