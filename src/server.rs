// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

// Connection supervisor.
//
// Owns the accept loop: one tracked task per client connection, each
// running its own pipeline over its own history. A failure in one
// connection never touches the listener or the other connections. On
// cancellation the listener stops accepting and active connections are
// awaited; each exits at its next idle point between turns.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipeline::{ChatSettings, RequestPipeline};
use crate::sanitize::Sanitizer;
use crate::upstream::ChatTransport;

/// Upper bound on one client line, newline included. A line that
/// reaches the cap without a newline closes the connection.
const MAX_LINE_BYTES: u64 = 64 * 1024;

pub struct RelayServer {
    transport: Arc<dyn ChatTransport>,
    sanitizer: Arc<dyn Sanitizer>,
    settings: ChatSettings,
}

impl RelayServer {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        sanitizer: Arc<dyn Sanitizer>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            transport,
            sanitizer,
            settings,
        }
    }

    /// Accept connections until `shutdown` fires, then drain.
    ///
    /// The caller binds the listener, so tests can bind port 0 and read
    /// the real address before the server runs.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "listening"),
            Err(e) => tracing::warn!(error = %e, "listening on unknown address"),
        }

        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                // Reap finished connection tasks as they end.
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = Uuid::new_v4();
                        tracing::info!(conn_id = %conn_id, peer = %peer, "client connected");
                        let pipeline = RequestPipeline::new(
                            Arc::clone(&self.transport),
                            Arc::clone(&self.sanitizer),
                            self.settings.clone(),
                            conn_id,
                        );
                        connections.spawn(handle_connection(
                            stream,
                            pipeline,
                            conn_id,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        // Transient failure; the listener stays up.
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        drop(listener);
        let active = connections.len();
        if active > 0 {
            tracing::info!(active, "draining connections");
        }
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                tracing::error!(error = %e, "connection task panicked");
            }
        }
        tracing::info!("relay stopped");
    }
}

/// One client connection: read lines, run one turn per line.
///
/// An in-flight turn always completes; shutdown is only observed while
/// waiting for the next line.
async fn handle_connection(
    stream: TcpStream,
    mut pipeline: RequestPipeline,
    conn_id: Uuid,
    shutdown: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_LINE_BYTES);
    let mut line = String::new();

    loop {
        line.clear();
        reader.set_limit(MAX_LINE_BYTES);
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(conn_id = %conn_id, "closing connection for shutdown");
                break;
            }
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => {
                tracing::info!(conn_id = %conn_id, "client disconnected");
                break;
            }
            Ok(_) => {
                // Budget exhausted with no newline: the line is over the cap.
                if reader.limit() == 0 && !line.ends_with('\n') {
                    tracing::warn!(conn_id = %conn_id, cap = MAX_LINE_BYTES, "line too long, closing connection");
                    break;
                }
                let text = line.trim_end_matches(['\r', '\n']);
                if text.is_empty() {
                    continue;
                }
                if let Err(e) = pipeline.run_turn(text, &mut writer).await {
                    tracing::warn!(conn_id = %conn_id, error = %e, "connection closed mid-turn");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "read failed");
                break;
            }
        }
    }
}
