use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command-line flags. Only flags that were actually given are layered over
/// the other sources, so an unset flag never hides a TOML or env value.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "relay-server", version, about = "Real-time chat relay server")]
pub struct Cli {
    /// Port to listen on [env: RELAY_PORT] [default: 8080]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [env: RELAY_BIND_ADDRESS] [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Chat history file, one JSON record per line [env: RELAY_LOG_FILE] [default: chat.log]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// fsync the chat history after every append [env: RELAY_SYNC_WRITES]
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sync_writes: bool,

    /// Enable structured JSON logging [env: RELAY_JSON_LOGS]
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Path to TOML config file
    #[arg(long, default_value = "./relay.toml")]
    #[serde(skip)]
    pub config: PathBuf,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Bind address
    pub bind_address: String,

    /// Chat history file
    pub log_file: PathBuf,

    /// fsync after every append
    pub sync_writes: bool,

    /// Structured JSON logging (for Docker/production)
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            log_file: PathBuf::from("chat.log"),
            sync_writes: false,
            json_logs: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RELAY_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Self::figment(cli).extract()
    }

    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("RELAY_"))
            .merge(Serialized::defaults(cli))
    }

    /// Address string handed to the TCP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chat Relay Server Configuration
# Place this file at ./relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Chat history file, appended to with one JSON object per line.
# Replayed in full to every client that joins. Never rotated or truncated.
# log_file = "chat.log"

# fsync the history file after every message (slower, survives power loss)
# sync_writes = false

# Enable structured JSON logging for Docker/production
# json_logs = false
"#
    .to_string()
}
