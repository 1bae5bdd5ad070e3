//! Use-case routing and the attempt-failure classification oracle.

use crate::RelayError;

use super::config::Route;

/// Routes are evaluated in declaration order; the first whose match
/// predicate equals the use case wins. Immutable after load.
#[derive(Debug)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// First route matching `use_case`, else the route named `"default"`,
    /// else a zero-value route (empty name, no targets) which the
    /// orchestrator surfaces as a bad-gateway error.
    pub fn route(&self, use_case: &str) -> Route {
        self.routes
            .iter()
            .find(|route| route.matches(use_case))
            .or_else(|| self.routes.iter().find(|route| route.name == "default"))
            .cloned()
            .unwrap_or_default()
    }
}

/// Whether a failed attempt may be re-tried against the same target.
///
/// Only transport-level failures qualify: connection refused, DNS, reset,
/// I/O timeout. A provider that answered with a non-2xx status spoke, just
/// unfavourably; retrying it would amplify load against a backend that is
/// already returning errors, so those fall through to the next target
/// instead.
pub fn is_retryable(err: &RelayError) -> bool {
    match err {
        RelayError::Http(err) => !err.is_status(),
        RelayError::Io(_) | RelayError::Timeout { .. } => true,
        RelayError::Api { .. }
        | RelayError::ProviderNotFound(_)
        | RelayError::InvalidResponse(_)
        | RelayError::Json(_) => false,
    }
}

/// Classic status-code retryability. Kept for reference and reporting; the
/// attempt loop deliberately does not consult it.
pub fn status_code_is_retryable(code: u16) -> bool {
    code == 429 || (500..=599).contains(&code)
}
