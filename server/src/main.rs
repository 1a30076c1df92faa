use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use relay_server::chat::MessageLog;
use relay_server::config::{generate_config_template, Cli, Config};
use relay_server::{routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    init_tracing(config.json_logs);

    tracing::info!("Chat relay v{} starting", env!("CARGO_PKG_VERSION"));

    let log = MessageLog::new(&config.log_file).with_sync_writes(config.sync_writes);
    tracing::info!(
        path = %log.path().display(),
        sync_writes = config.sync_writes,
        "Chat history file"
    );

    let app = routes::build_router(state::AppState::new(log));

    // Bind and serve
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("WebSocket server running on ws://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_server=info"))
    };

    if json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter()).init();
    }
}
