//! Provider adapters and the contract the orchestrator requires of them.

mod anthropic;
mod openai;

pub use anthropic::Anthropic;
pub use openai::OpenAi;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{ChatChunk, ChatRequest, ChatResponse};
use crate::{RelayError, Result};

/// Incremental chunks of a streamed completion. Closed by the adapter when
/// the upstream stream ends.
pub type ChunkSource = mpsc::Receiver<ChatChunk>;
/// Terminal stream failure, if any. Closed together with the chunk source.
pub type ErrorSource = mpsc::Receiver<RelayError>;

/// What the orchestrator needs from a backend. Wire formats and auth
/// headers are the adapter's concern; responses come back in the canonical
/// shape.
#[async_trait]
pub trait Provider: Send + Sync {
    /// One buffered round trip.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Kick off a streamed completion. Returns immediately with two
    /// independent sources; the adapter guarantees both are closed when its
    /// producer exits, whether the stream ended cleanly or not.
    fn chat_stream(&self, request: &ChatRequest) -> (ChunkSource, ErrorSource);
}

/// Read-only after init; shared across requests.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: impl Provider + 'static) {
        self.providers.insert(name.into(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }
}

/// Capacity of the chunk source; the error source always has room for its
/// single terminal message.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 32;

pub(crate) fn stream_channels() -> (
    mpsc::Sender<ChatChunk>,
    ChunkSource,
    mpsc::Sender<RelayError>,
    ErrorSource,
) {
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);
    (chunk_tx, chunk_rx, err_tx, err_rx)
}

pub(crate) fn epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Choice, Message, Role, Usage};

    struct NullProvider;

    #[async_trait]
    impl Provider for NullProvider {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                id: "null".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::new(Role::Assistant, ""),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }

        fn chat_stream(&self, _request: &ChatRequest) -> (ChunkSource, ErrorSource) {
            let (_chunk_tx, chunk_rx, _err_tx, err_rx) = stream_channels();
            (chunk_rx, err_rx)
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register("null", NullProvider);
        assert!(registry.get("null").is_some());
        assert!(registry.get("missing").is_none());
    }
}
