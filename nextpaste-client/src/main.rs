use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use nextpaste_client::{
    ClientConfig, ConnectionStatus, DirectorySink, SyncClient, config::default_config_path,
    load_config_from_path,
};
use nextpaste_core::{MIME_IMAGE_PNG, MIME_OCTET_STREAM};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nextpaste")]
struct ClientArgs {
    /// Server url, e.g. ws://relay.example:8080/v11/ws/my-room
    #[arg(long)]
    url: Option<String>,

    /// Name announced to peers in the handshake.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Where received images and files are saved.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn resolve_config(args: &ClientArgs) -> Result<ClientConfig, String> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)
            .map_err(|err| format!("failed to load config {}: {err}", path.display()))?,
        None => {
            let path = default_config_path();
            if path.exists() {
                load_config_from_path(&path)
                    .map_err(|err| format!("failed to load config {}: {err}", path.display()))?
            } else {
                ClientConfig::default()
            }
        }
    };

    if let Some(url) = &args.url {
        config.server_url = Some(url.clone());
    }
    if let Some(name) = &args.name {
        config.device_name = name.clone();
    }
    Ok(config)
}

fn mime_for_path(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => MIME_IMAGE_PNG,
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain",
        _ => MIME_OCTET_STREAM,
    }
}

/// `/image <path>` and `/file <path>` send from disk; any other line is sent as text.
async fn handle_line(client: &SyncClient, line: &str) {
    let result = if let Some(path) = line.strip_prefix("/image ") {
        let path = PathBuf::from(path.trim());
        match tokio::fs::read(&path).await {
            Ok(data) => client.send_image(&data, mime_for_path(&path)).await,
            Err(err) => {
                warn!("failed to read {}: {}", path.display(), err);
                return;
            }
        }
    } else if let Some(path) = line.strip_prefix("/file ") {
        let path = PathBuf::from(path.trim());
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file.bin")
            .to_owned();
        match tokio::fs::read(&path).await {
            Ok(data) => client.send_file(&name, &data, mime_for_path(&path)).await,
            Err(err) => {
                warn!("failed to read {}: {}", path.display(), err);
                return;
            }
        }
    } else if line.is_empty() {
        return;
    } else {
        client.send_text(line).await
    };

    if let Err(err) = result {
        warn!("send failed: {}", err);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = ClientArgs::parse();
    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    };
    let Some(url) = config.server_url.clone() else {
        error!("no server url; pass --url or set server_url in the config file");
        std::process::exit(1);
    };

    let client = SyncClient::new(config, Arc::new(DirectorySink::new(&args.output_dir)));
    client.set_on_connected(|| info!("ready; type a line to share it"));
    if let Err(err) = client.connect(&url) {
        error!("{}", err);
        std::process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status_tick = tokio::time::interval(Duration::from_millis(500));
    let mut exit_code = 0;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_line(&client, &line).await,
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("stdin read failed: {}", err);
                    stdin_open = false;
                }
            },
            _ = status_tick.tick() => {
                if client.status() == ConnectionStatus::Disconnected {
                    exit_code = 1;
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await;
    std::process::exit(exit_code);
}
