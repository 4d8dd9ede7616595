// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

// Upstream completion transport.
//
// `ChatTransport` is the seam between the pipeline and the network:
// production uses `HttpChatTransport` over reqwest, tests inject
// scripted transports. The transport returns the raw response byte
// stream; decoding happens in `stream::decoder`.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use serde::Serialize;

use crate::message::Turn;

/// Body of a streaming completion call.
///
/// `messages` carries the full conversation so far; `stream` is always
/// true on this wire.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Turn>,
    pub temperature: f64,
    pub stream: bool,
}

/// Errors surfaced by a completion call.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Raw response bytes as they arrive off the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Issues one completion call and hands back the response stream.
///
/// Dropping the returned stream cancels the in-flight call.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: CompletionRequest) -> Result<ByteStream, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Reqwest transport
// ---------------------------------------------------------------------------

/// Production transport: JSON POST with bearer auth, streamed response.
pub struct HttpChatTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpChatTransport {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send(&self, request: CompletionRequest) -> Result<ByteStream, UpstreamError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(e.to_string())
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            // Read the body so the operator log says what went wrong.
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| UpstreamError::Transport(e.to_string()));
        Ok(Box::pin(stream))
    }
}
