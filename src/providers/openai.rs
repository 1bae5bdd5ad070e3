use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::types::{ChatChunk, ChatRequest, ChatResponse, Message};
use crate::{RelayError, Result};

use super::{ChunkSource, ErrorSource, stream_channels};

/// OpenAI chat-completions adapter. The upstream wire format matches the
/// canonical shape, so no response translation is needed.
#[derive(Clone)]
pub struct OpenAi {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

impl<'a> WireRequest<'a> {
    fn from_chat(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn check_api_key(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(RelayError::InvalidResponse(
                "openai api key is not set".to_string(),
            ));
        }
        Ok(())
    }

    async fn stream_into(
        &self,
        request: &ChatRequest,
        chunk_tx: &mpsc::Sender<ChatChunk>,
    ) -> Result<()> {
        self.check_api_key()?;

        let body = WireRequest::from_chat(request, true);
        let response = self
            .http
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Api { status, body });
        }

        let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                break;
            }
            // Unparseable frames are skipped, not fatal.
            let Ok(chunk) = serde_json::from_str::<ChatChunk>(data) else {
                continue;
            };
            if chunk_tx.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl super::Provider for OpenAi {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.check_api_key()?;

        let body = WireRequest::from_chat(request, false);
        let response = self
            .http
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RelayError::Api { status, body: text });
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn chat_stream(&self, request: &ChatRequest) -> (ChunkSource, ErrorSource) {
        let (chunk_tx, chunk_rx, err_tx, err_rx) = stream_channels();
        let provider = self.clone();
        let request = request.clone();
        tokio::spawn(async move {
            if let Err(err) = provider.stream_into(&request, &chunk_tx).await {
                let _ = err_tx.send(err).await;
            }
        });
        (chunk_rx, err_rx)
    }
}
