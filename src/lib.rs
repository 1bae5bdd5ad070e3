mod error;

pub mod gateway;
pub mod providers;
pub mod types;

pub use error::{RelayError, Result};
pub use gateway::{Config, GatewayState, RateLimiter, Router, UsageStore};
pub use providers::{Anthropic, OpenAi, Provider, ProviderRegistry};
pub use types::{ChatChunk, ChatRequest, ChatResponse, Choice, Message, Role, Usage};
