// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

// Request pipeline, one per client connection.
//
// A turn takes one client line, issues a completion call carrying the
// full history, and forwards decoded text to the client while the
// response is still arriving. Upstream failures are absorbed into the
// turn: logged, terminator still written, connection kept. A client
// write failure ends the connection and aborts the in-flight call.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::message::ConversationHistory;
use crate::sanitize::Sanitizer;
use crate::stream::{relay_channel, EventStreamDecoder, Fragment, FragmentSender};
use crate::upstream::{ChatTransport, CompletionRequest, UpstreamError};

/// Marker written to the client after every turn, error or not.
/// Exactly these five bytes, no trailing newline.
pub const TURN_TERMINATOR: &[u8] = b"/done";

/// Connection-independent inputs of every pipeline.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub temperature: f64,
}

/// Per-connection state: the conversation plus everything needed to
/// run a turn against the upstream endpoint.
pub struct RequestPipeline {
    transport: Arc<dyn ChatTransport>,
    sanitizer: Arc<dyn Sanitizer>,
    settings: ChatSettings,
    history: ConversationHistory,
    conn_id: Uuid,
    turn: u64,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        sanitizer: Arc<dyn Sanitizer>,
        settings: ChatSettings,
        conn_id: Uuid,
    ) -> Self {
        Self {
            transport,
            sanitizer,
            settings,
            history: ConversationHistory::new(),
            conn_id,
            turn: 0,
        }
    }

    /// The conversation so far. Raw model output, not the sanitized
    /// copy the client saw.
    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run one turn: record the user line, stream the response back to
    /// `client`, record the assistant reply, write the terminator.
    ///
    /// `Err` means the client side is gone. Upstream failures are
    /// handled in here and do not end the connection.
    pub async fn run_turn<W>(&mut self, line: &str, client: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.turn += 1;
        let turn = self.turn;
        let started = Instant::now();

        self.history.push_user(line);
        tracing::debug!(
            conn_id = %self.conn_id,
            turn,
            prompt_bytes = line.len(),
            history_turns = self.history.len(),
            "turn started"
        );

        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: self.history.turns().to_vec(),
            temperature: self.settings.temperature,
            stream: true,
        };

        let (tx, mut rx) = relay_channel();
        let transport = Arc::clone(&self.transport);
        let producer = tokio::spawn(stream_completion(transport, request, tx));

        let mut assistant_text = String::new();
        let mut client_error: Option<std::io::Error> = None;
        while let Some(batch) = rx.next_text().await {
            assistant_text.push_str(&batch);
            let cleaned = self.sanitizer.sanitize(&batch);
            if cleaned.is_empty() {
                continue;
            }
            if let Err(e) = client.write_all(cleaned.as_bytes()).await {
                client_error = Some(e);
                break;
            }
        }

        if let Some(e) = client_error {
            // Client hung up mid-turn. Stop the upstream read with it.
            drop(rx);
            producer.abort();
            let _ = producer.await;
            tracing::warn!(conn_id = %self.conn_id, turn, error = %e, "client write failed mid-turn");
            return Err(e);
        }

        match producer.await {
            Ok(Ok(())) => {
                tracing::info!(
                    conn_id = %self.conn_id,
                    turn,
                    response_bytes = assistant_text.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "turn complete"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(conn_id = %self.conn_id, turn, error = %e, "upstream request failed");
            }
            Err(e) => {
                tracing::error!(conn_id = %self.conn_id, turn, error = %e, "stream task failed");
            }
        }

        if !assistant_text.is_empty() {
            self.history.push_assistant(assistant_text);
        }

        client.write_all(TURN_TERMINATOR).await?;
        client.flush().await?;
        Ok(())
    }
}

/// Producer side of one turn: issue the call, decode every chunk, hand
/// fragments to the relay. Returns when the response stream ends, the
/// terminator is decoded, or the consumer hangs up.
async fn stream_completion(
    transport: Arc<dyn ChatTransport>,
    request: CompletionRequest,
    tx: FragmentSender,
) -> Result<(), UpstreamError> {
    let mut stream = transport.send(request).await?;
    let mut decoder = EventStreamDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for fragment in decoder.feed(&chunk) {
            let end = matches!(fragment, Fragment::EndOfStream);
            if !tx.push(fragment).await {
                // Consumer gone; dropping the stream cancels the call.
                return Ok(());
            }
            if end {
                return Ok(());
            }
        }
    }
    // Implicit end: the response closed cleanly with no terminator.
    if !decoder.is_finished() {
        tracing::warn!("stream ended without terminator");
    }
    Ok(())
}
