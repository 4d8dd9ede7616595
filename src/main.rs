// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use towline::config;
use towline::pipeline::ChatSettings;
use towline::sanitize::LegacyCharsetFilter;
use towline::server::RelayServer;
use towline::upstream::HttpChatTransport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "towline", about = "TCP-to-LLM streaming relay")]
struct Cli {
    /// Path to the towline.yaml config file
    #[arg(long, default_value = "towline.yaml", env = "TOWLINE_CONFIG")]
    config: String,

    /// Listen address override, e.g. 0.0.0.0:8080
    #[arg(long, env = "TOWLINE_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let source = config::FileSource {
        path: std::path::PathBuf::from(cli.config),
    };
    let config = match config::load_config(&source) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let addr = cli.listen.unwrap_or(config.listen);

    tracing::info!(
        %addr,
        api_url = %config.api_url,
        model = %config.model,
        temperature = config.temperature,
        "towline starting"
    );

    // One HTTP client for the life of the process, shared by every
    // connection.
    let transport = Arc::new(HttpChatTransport::new(
        reqwest::Client::new(),
        &config.api_url,
        &config.api_key,
    ));
    let settings = ChatSettings {
        model: config.model.clone(),
        temperature: config.temperature,
    };
    let server = RelayServer::new(transport, Arc::new(LegacyCharsetFilter), settings);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal.cancel();
        }
    });

    server.run(listener, shutdown).await;
}
