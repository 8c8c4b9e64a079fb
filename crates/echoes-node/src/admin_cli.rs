//! echoes-admin CLI tool
//!
//! Manages admins and epoch closure for a running echoes-node, and mints
//! session tokens.
//!
//! Usage:
//!   echoes-admin add-admin <public_key>
//!   echoes-admin remove-admin <public_key>
//!   echoes-admin list-admins
//!   echoes-admin is-admin <public_key>
//!   echoes-admin state
//!   echoes-admin close-epoch <epoch_id> <narrative.json> [by]
//!   echoes-admin resume-closure
//!   echoes-admin keygen
//!   echoes-admin mint-token <secret_key_hex> [hours]
//!   echoes-admin ping

use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use echoes_node::identity::issue_session_token;
use echoes_node::models::NarrativeDraft;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// Admin command sent over the socket.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum AdminCommand {
    AddAdmin { public_key: String },
    RemoveAdmin { public_key: String },
    ListAdmins,
    IsAdmin { public_key: String },
    State,
    CloseEpoch {
        epoch_id: u64,
        narrative: NarrativeDraft,
        by: Option<String>,
    },
    ResumeClosure,
    Ping,
}

/// Response from admin command.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    List { items: Vec<String> },
    Bool { value: bool },
    Json { value: serde_json::Value },
    Pong,
}

fn print_usage() {
    eprintln!("echoes-admin - Manage a Library of Echoes node");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  echoes-admin add-admin <public_key>             Add an admin");
    eprintln!("  echoes-admin remove-admin <public_key>          Remove an admin");
    eprintln!("  echoes-admin list-admins                        List all admins");
    eprintln!("  echoes-admin is-admin <public_key>              Check if key is admin");
    eprintln!("  echoes-admin state                              Show the current epoch");
    eprintln!("  echoes-admin close-epoch <id> <file.json> [by]  Close an epoch with a narrative");
    eprintln!("  echoes-admin resume-closure                     Finish an interrupted closure");
    eprintln!("  echoes-admin keygen                             Generate an Ed25519 keypair");
    eprintln!("  echoes-admin mint-token <secret_hex> [hours]    Mint a session token (default 24h)");
    eprintln!("  echoes-admin ping                               Check if daemon is running");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  ECHOES_SOCKET  Path to admin socket (default: ./echoes-data/admin.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("ECHOES_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./echoes-data/admin.sock"))
}

fn send_command(cmd: AdminCommand) -> Result<AdminResponse, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to echoes-node at {:?}: {}\n\
             Is the echoes-node running?",
            socket_path, e
        )
    })?;

    // Send command
    let cmd_json = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    // Read response
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn required<'a>(args: &'a [String], index: usize, what: &str) -> &'a str {
    match args.get(index) {
        Some(arg) => arg,
        None => fail(format!("{} requires a {} argument", args[1], what)),
    }
}

fn read_narrative(path: &str) -> NarrativeDraft {
    let contents = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("Cannot read {}: {}", path, e)));
    serde_json::from_str(&contents).unwrap_or_else(|e| fail(format!("Invalid narrative JSON: {}", e)))
}

fn keygen() {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    println!("secret: {}", hex::encode(key.to_bytes()));
    println!("public: {}", hex::encode(key.verifying_key().as_bytes()));
}

fn mint_token(secret_hex: &str, hours: &str) {
    let secret: [u8; 32] = hex::decode(secret_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .unwrap_or_else(|| fail("secret key must be 32 bytes of hex"));
    let hours: i64 = hours
        .parse()
        .unwrap_or_else(|_| fail(format!("Invalid hours: {}", hours)));
    let key = SigningKey::from_bytes(&secret);
    println!("{}", issue_session_token(&key, Utc::now() + Duration::hours(hours)));
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = match args[1].as_str() {
        "add-admin" => AdminCommand::AddAdmin {
            public_key: required(&args, 2, "public_key").to_string(),
        },
        "remove-admin" => AdminCommand::RemoveAdmin {
            public_key: required(&args, 2, "public_key").to_string(),
        },
        "list-admins" => AdminCommand::ListAdmins,
        "is-admin" => AdminCommand::IsAdmin {
            public_key: required(&args, 2, "public_key").to_string(),
        },
        "state" => AdminCommand::State,
        "close-epoch" => {
            let epoch_id = required(&args, 2, "epoch_id");
            let epoch_id = epoch_id
                .parse()
                .unwrap_or_else(|_| fail(format!("Invalid epoch id: {}", epoch_id)));
            AdminCommand::CloseEpoch {
                epoch_id,
                narrative: read_narrative(required(&args, 3, "narrative file")),
                by: args.get(4).cloned(),
            }
        }
        "resume-closure" => AdminCommand::ResumeClosure,
        "keygen" => {
            keygen();
            return;
        }
        "mint-token" => {
            let secret = required(&args, 2, "secret key");
            mint_token(secret, args.get(3).map(String::as_str).unwrap_or("24"));
            return;
        }
        "ping" => AdminCommand::Ping,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };

    match send_command(cmd) {
        Ok(response) => match response {
            AdminResponse::Ok { message } => {
                println!("{}", message);
            }
            AdminResponse::Error { error } => fail(error),
            AdminResponse::List { items } => {
                if items.is_empty() {
                    println!("(none)");
                } else {
                    for item in items {
                        println!("{}", item);
                    }
                }
            }
            AdminResponse::Bool { value } => {
                println!("{}", value);
                if !value {
                    std::process::exit(1);
                }
            }
            AdminResponse::Json { value } => {
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            }
            AdminResponse::Pong => {
                println!("pong - echoes-node is running");
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
