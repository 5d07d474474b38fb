use std::{sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use nextpaste_core::{ClipboardContent, ClipboardSink};
use nextpaste_server::{
    AppState, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_QUEUE_CAPACITY, DirectServer, ServerConfig, serve,
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Forward frames between members of a room.
    Relay,
    /// Act as a desktop peer that clients connect to directly.
    Direct,
}

#[derive(Parser, Debug)]
#[command(name = "nextpaste-server")]
struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,

    #[arg(long, value_enum, default_value_t = Mode::Relay)]
    mode: Mode,

    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Seconds without any inbound traffic before a connection is dropped.
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    keepalive_secs: u64,

    #[arg(long, default_value_t = 10)]
    write_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
}

impl ServerArgs {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            queue_capacity: self.queue_capacity,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            max_message_bytes: self.max_message_bytes,
            ..ServerConfig::default()
        }
    }
}

/// Stands in for the desktop clipboard when running headless.
struct LoggingSink;

impl ClipboardSink for LoggingSink {
    fn write(&self, content: ClipboardContent) {
        info!(
            kind = %content.kind,
            mime = %content.mime,
            name = content.name.as_deref().unwrap_or("-"),
            bytes = content.bytes.len(),
            "clipboard updated"
        );
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!("nextpaste-server starting on {} in {:?} mode", args.bind_address, args.mode);
    let result = match args.mode {
        Mode::Relay => serve(listener, AppState::with_config(args.config()), shutdown_signal()).await,
        Mode::Direct => {
            DirectServer::new(Arc::new(LoggingSink), args.config())
                .serve(listener, shutdown_signal())
                .await
        }
    };

    if let Err(err) = result {
        warn!("server exited: {}", err);
    }
}
