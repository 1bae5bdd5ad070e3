use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::types::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, Delta, Message, Role, Usage,
};
use crate::{RelayError, Result};

use super::{ChunkSource, ErrorSource, epoch_seconds, stream_channels};

// The Messages API requires max_tokens; applied when the client left it out.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic Messages adapter. Translates between the canonical
/// chat-completion shape and the native Messages request/response and
/// streaming-event formats.
#[derive(Clone)]
pub struct Anthropic {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    version: String,
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl WireRequest {
    fn from_chat(request: &ChatRequest, stream: bool) -> Self {
        let mut system = String::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&message.content);
                }
                Role::User => messages.push(WireMessage {
                    role: "user",
                    content: message.content.clone(),
                }),
                Role::Assistant => messages.push(WireMessage {
                    role: "assistant",
                    content: message.content.clone(),
                }),
            }
        }

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system.is_empty()).then_some(system),
            temperature: request.temperature,
            stream,
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl WireResponse {
    fn into_chat_response(self) -> ChatResponse {
        let content = self
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<String>();

        ChatResponse {
            id: self.id,
            object: self.kind,
            created: epoch_seconds(),
            model: self.model,
            choices: vec![Choice {
                index: 0,
                message: Message::new(Role::Assistant, content),
                finish_reason: self.stop_reason.unwrap_or_default(),
            }],
            usage: Usage {
                prompt_tokens: self.usage.input_tokens,
                completion_tokens: self.usage.output_tokens,
                total_tokens: self.usage.input_tokens + self.usage.output_tokens,
            },
        }
    }
}

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStart,
}

#[derive(Deserialize)]
struct MessageStart {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    #[serde(default)]
    index: u32,
    delta: ContentDelta,
}

#[derive(Deserialize)]
struct ContentDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
}

#[derive(Deserialize)]
struct MessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

impl Anthropic {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            version: version.into(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }

    fn check_api_key(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(RelayError::InvalidResponse(
                "anthropic api key is not set".to_string(),
            ));
        }
        Ok(())
    }

    fn post(&self, body: &WireRequest) -> reqwest::RequestBuilder {
        self.http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(body)
    }

    async fn stream_into(
        &self,
        request: &ChatRequest,
        chunk_tx: &mpsc::Sender<ChatChunk>,
    ) -> Result<()> {
        self.check_api_key()?;

        let body = WireRequest::from_chat(request, true);
        let response = self
            .post(&body)
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Api { status, body });
        }

        let mut message_id = String::new();
        let mut model = String::new();
        let mut created = 0i64;
        let mut event = String::new();

        let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if let Some(name) = line.strip_prefix("event:") {
                event = name.trim().to_string();
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();

            match event.as_str() {
                "message_start" => {
                    let Ok(start) = serde_json::from_str::<MessageStartEvent>(data) else {
                        continue;
                    };
                    message_id = start.message.id;
                    model = start.message.model;
                    created = epoch_seconds();
                }
                "content_block_delta" => {
                    let Ok(parsed) = serde_json::from_str::<ContentBlockDeltaEvent>(data) else {
                        continue;
                    };
                    if parsed.delta.kind != "text_delta" {
                        continue;
                    }
                    let chunk = ChatChunk {
                        id: message_id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: model.clone(),
                        choices: vec![ChunkChoice {
                            index: parsed.index,
                            delta: Delta {
                                content: parsed.delta.text,
                            },
                            finish_reason: None,
                        }],
                    };
                    if chunk_tx.send(chunk).await.is_err() {
                        return Ok(());
                    }
                }
                "message_delta" => {
                    let Ok(parsed) = serde_json::from_str::<MessageDeltaEvent>(data) else {
                        continue;
                    };
                    let Some(stop_reason) = parsed.delta.stop_reason else {
                        continue;
                    };
                    let chunk = ChatChunk {
                        id: message_id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: model.clone(),
                        choices: vec![ChunkChoice {
                            index: 0,
                            delta: Delta::default(),
                            finish_reason: Some(stop_reason),
                        }],
                    };
                    if chunk_tx.send(chunk).await.is_err() {
                        return Ok(());
                    }
                }
                "message_stop" => return Ok(()),
                "error" => {
                    return Err(RelayError::InvalidResponse(format!(
                        "anthropic stream error: {data}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl super::Provider for Anthropic {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.check_api_key()?;

        let body = WireRequest::from_chat(request, false);
        let response = self.post(&body).send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RelayError::Api { status, body: text });
        }
        let parsed: WireResponse = serde_json::from_str(&text)?;
        Ok(parsed.into_chat_response())
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
