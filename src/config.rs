use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub graphql: Option<GraphqlConfig>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphqlConfig {
    pub endpoint: String,
    /// Bearer token. Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per query, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SandboxConfig {
    /// Wall-clock limit for one processor run. No limit when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub console: ConsoleTarget,
}

/// Where processor `console.*` calls end up.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleTarget {
    /// One line per call on stdout
    #[default]
    Stdout,
    /// One tracing event per call
    Log,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

impl GraphqlConfig {
    /// Same settings against another endpoint (recipe override).
    pub fn with_endpoint(&self, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..self.clone()
        }
    }

    /// Checks the endpoint is an http(s) URL
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| anyhow::anyhow!("invalid GraphQL endpoint '{}': {e}", self.endpoint))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => anyhow::bail!(
                "unsupported GraphQL endpoint scheme '{scheme}' (only http/https)"
            ),
        }
        if self.max_attempts == 0 {
            anyhow::bail!("graphql.max_attempts must be at least 1");
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ATTESTOR_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if let Some(graphql) = &config.graphql {
            graphql.validate()?;
        }
        Ok(config)
    }

    /// Loads `path` when given, else `attestor.toml` if it exists, else defaults.
    pub fn discover(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new("attestor.toml");
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}
