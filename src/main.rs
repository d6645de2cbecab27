//! Room relay broker
//!
//! Relays WebSocket payloads between the members of named rooms and buffers
//! payloads for asynchronous rooms until a peer joins.
//!
//! Usage:
//!   cargo run -- serve                                # Listen on 0.0.0.0:8080
//!   cargo run -- serve --port 9000                    # Listen on a specific port
//!   cargo run -- serve --redis-url redis://127.0.0.1/ # Durable buffering

use room_relay::{RelayConfig, RelayServer};
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    // Bare flags imply `serve`
    let command = match args.get(1) {
        Some(arg) if !arg.starts_with("--") || arg == "--help" => arg.as_str(),
        _ => "serve",
    };

    match command {
        "serve" => {
            let config = load_config(&args)?;
            run_server(config).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("room-relay - WebSocket room relay with catch-up buffering");
    println!();
    println!("USAGE:");
    println!("    cargo run -- [serve] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    serve                   Start the relay broker (default)");
    println!("    help                    Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>           Port to listen on (default: 8080)");
    println!("    --redis-url <URL>       Redis URL for durable buffering");
    println!("    --config <FILE>         JSON configuration file");
    println!();
    println!("ENVIRONMENT:");
    println!("    RELAY_PORT / PORT       Port to listen on");
    println!("    REDIS_URL               Redis URL for durable buffering");
    println!("    RUST_LOG                Log filter (default: info)");
    println!();
    println!("CLIENTS:");
    println!("    ws://host:8080/<room>?async=1&token=<secret>");
    println!("    The legacy /ws/<room> form is also accepted.");
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// Defaults, then the config file, then the environment, then flags
fn load_config(args: &[String]) -> room_relay::Result<RelayConfig> {
    let mut config = match arg_value(args, "--config") {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    config.apply_env()?;

    if let Some(port) = arg_value(args, "--port") {
        let port: u16 = port
            .parse()
            .map_err(|_| room_relay::RelayError::config(format!("Invalid port: {}", port)))?;
        config.bind_addr.set_port(port);
    }

    if let Some(url) = arg_value(args, "--redis-url") {
        config.redis_url = Some(url.to_string());
    }

    config.validate()?;
    Ok(config)
}

async fn run_server(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting room relay...");
    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections per IP: {}", config.max_connections_per_ip);
    info!("  - Max rooms: {}", config.max_rooms);
    info!("  - Max members per room: {}", config.max_members_per_room);
    info!("  - Max message size: {} bytes", config.max_message_size);
    info!(
        "  - Rate limit: {} msgs per {} ms",
        config.rate_limit_max_messages, config.rate_limit_window_ms
    );

    let server = RelayServer::new(config).await;
    let trigger = server.shutdown_trigger();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            trigger.trigger();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
