use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `(provider, model)` pair the orchestrator may dispatch to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub use_case: String,
}

/// A named routing policy: match predicate, primary target, ordered
/// fallbacks, per-attempt deadline and retry budget. Immutable after load.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    #[serde(default)]
    pub r#match: Match,
    #[serde(default)]
    pub primary: Target,
    #[serde(default)]
    pub fallbacks: Vec<Target>,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

impl Route {
    pub fn matches(&self, use_case: &str) -> bool {
        self.r#match.use_case == use_case
    }

    /// Primary first, then fallbacks in declaration order.
    pub fn targets(&self) -> Vec<Target> {
        let mut targets = Vec::with_capacity(1 + self.fallbacks.len());
        targets.push(self.primary.clone());
        targets.extend(self.fallbacks.iter().cloned());
        targets
    }
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Clone, Debug, Default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub base_url: String,
    pub version: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub tokens_per_minute: i64,
    pub routes: Vec<Route>,
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read routes config {path}: {source}")]
    RoutesIo {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse routes config {path}: {source}")]
    RoutesYaml {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

impl Config {
    /// Environment plus the YAML routes file named by `ROUTES_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_vars(&env)
    }

    fn from_vars(env: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_env(env, "PORT", 8080)?;
        let tokens_per_minute = parse_env(env, "TOKENS_PER_MINUTE", 50_000)?;

        let routes_path = get(env, "ROUTES_CONFIG", "configs/routes.yaml");
        let routes = load_routes(&routes_path)?;

        Ok(Self {
            port,
            database_url: get(env, "DATABASE_URL", "relay-llm.db"),
            redis_url: get(env, "REDIS_URL", "redis://localhost:6379/0"),
            tokens_per_minute,
            routes,
            openai: ProviderSettings {
                api_key: get(env, "OPENAI_API_KEY", ""),
                base_url: get(env, "OPENAI_API_URL", "https://api.openai.com/v1"),
                version: get(env, "OPENAI_API_VERSION", "v1"),
            },
            anthropic: ProviderSettings {
                api_key: get(env, "ANTHROPIC_API_KEY", ""),
                base_url: get(env, "ANTHROPIC_API_URL", "https://api.anthropic.com/v1"),
                version: get(env, "ANTHROPIC_API_VERSION", "2023-06-01"),
            },
        })
    }
}

pub fn load_routes(path: impl AsRef<Path>) -> Result<Vec<Route>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::RoutesIo {
        path: path.display().to_string(),
        source,
    })?;
    parse_routes(&raw).map_err(|source| ConfigError::RoutesYaml {
        path: path.display().to_string(),
        source,
    })
}

pub fn parse_routes(raw: &str) -> Result<Vec<Route>, serde_yaml::Error> {
    let file: RoutesFile = serde_yaml::from_str(raw)?;
    Ok(file.routes)
}

fn get(env: &BTreeMap<String, String>, name: &str, fallback: &str) -> String {
    env.get(name)
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

fn parse_env<T>(
    env: &BTreeMap<String, String>,
    name: &'static str,
    fallback: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env.get(name).filter(|value| !value.is_empty()) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidEnv {
            name,
            value: raw.clone(),
        }),
        None => Ok(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
routes:
  - name: support
    match: { use_case: support_summary }
    primary: { provider: openai, model: gpt-4o-mini }
    fallbacks:
      - { provider: anthropic, model: claude-3-5-sonnet }
    timeout_ms: 10000
    retries: 1
  - name: default
    match: { use_case: default }
    primary: { provider: openai, model: gpt-4o-mini }
"#;

    #[test]
    fn parses_routes_yaml() {
        let routes = parse_routes(SAMPLE).expect("routes");
        assert_eq!(routes.len(), 2);

        let support = &routes[0];
        assert_eq!(support.name, "support");
        assert_eq!(support.r#match.use_case, "support_summary");
        assert_eq!(support.primary.provider, "openai");
        assert_eq!(support.fallbacks.len(), 1);
        assert_eq!(support.timeout_ms, 10_000);
        assert_eq!(support.retries, 1);

        let default = &routes[1];
        assert!(default.fallbacks.is_empty());
        assert_eq!(default.retries, 0);
    }

    #[test]
    fn targets_lists_primary_then_fallbacks() {
        let routes = parse_routes(SAMPLE).expect("routes");
        let targets = routes[0].targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].provider, "openai");
        assert_eq!(targets[1].provider, "anthropic");
    }

    #[test]
    fn missing_routes_file_is_an_error() {
        let env = BTreeMap::from([(
            "ROUTES_CONFIG".to_string(),
            "/definitely/not/a/file.yaml".to_string(),
        )]);
        // Routes file is required, so a missing one is the only failure here.
        assert!(matches!(
            Config::from_vars(&env),
            Err(ConfigError::RoutesIo { .. })
        ));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let env = BTreeMap::from([("PORT".to_string(), "eighty".to_string())]);
        assert!(matches!(
            Config::from_vars(&env),
            Err(ConfigError::InvalidEnv { name: "PORT", .. })
        ));
    }
}
