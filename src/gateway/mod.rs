//! The request orchestration core: admission control, routing, the
//! retry-then-fallback attempt loop, dual-mode response delivery and the
//! usage journal.

pub mod config;
pub mod costing;
pub mod http;
pub mod limits;
pub mod router;
pub mod token_count;
pub mod usage;

pub use config::{Config, ConfigError, Match, ProviderSettings, Route, Target};
pub use http::GatewayState;
pub use limits::{AdmissionControl, LimitsError, RateLimiter};
pub use router::{Router, is_retryable, status_code_is_retryable};
pub use usage::{AttemptRecord, AttemptRow, RequestRow, UsageRecord, UsageStore, UsageStoreError};
