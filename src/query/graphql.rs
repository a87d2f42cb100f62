//! GraphQL over HTTP.
//!
//! POSTs `{query, variables}` as JSON and returns the `data` member of the
//! response. A non-empty `errors` array fails the query even when partial
//! data came back.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::backoff::{is_transient_error, is_transient_status, Backoff};
use super::QueryClient;
use crate::config::GraphqlConfig;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// First retry delay; doubles up to `MAX_RETRY_DELAY`.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);

/// User-Agent header sent with requests.
const USER_AGENT: &str = concat!("attestor/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// Client for one GraphQL endpoint.
pub struct GraphqlClient {
    client: Client,
    config: GraphqlConfig,
}

impl GraphqlClient {
    pub fn new(config: GraphqlConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config })
    }

    async fn send_once(&self, request: &GraphqlRequest<'_>) -> Result<Value, Attempt> {
        let mut builder = self.client.post(&self.config.endpoint).json(request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if is_transient_error(&e) {
                Attempt::Retry(anyhow!("request to {} failed: {e}", self.config.endpoint))
            } else {
                Attempt::Fail(anyhow!("request to {} failed: {e}", self.config.endpoint))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = anyhow!("GraphQL endpoint returned {status}: {body}");
            return Err(if is_transient_status(status) {
                Attempt::Retry(error)
            } else {
                Attempt::Fail(error)
            });
        }

        let body: GraphqlResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fail(anyhow!("invalid GraphQL response: {e}")))?;
        into_data(body).map_err(Attempt::Fail)
    }
}

/// Outcome of a failed request.
enum Attempt {
    Retry(anyhow::Error),
    Fail(anyhow::Error),
}

fn into_data(response: GraphqlResponse) -> Result<Value> {
    if !response.errors.is_empty() {
        let messages: Vec<&str> = response.errors.iter().map(|e| e.message.as_str()).collect();
        bail!("GraphQL errors: {}", messages.join("; "));
    }
    response
        .data
        .ok_or_else(|| anyhow!("GraphQL response has neither data nor errors"))
}

#[async_trait]
impl QueryClient for GraphqlClient {
    async fn fetch(&self, query: &str, variables: &Map<String, Value>) -> Result<Value> {
        let request = GraphqlRequest { query, variables };
        let mut backoff = Backoff::new(
            INITIAL_RETRY_DELAY,
            MAX_RETRY_DELAY,
            2,
            self.config.max_attempts,
        );

        loop {
            debug!("POST {} (attempt {})", self.config.endpoint, backoff.attempt + 1);
            match self.send_once(&request).await {
                Ok(data) => return Ok(data),
                Err(Attempt::Fail(e)) => return Err(e),
                Err(Attempt::Retry(e)) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("{e}; retrying in {}ms", delay.as_millis());
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(e.context(format!(
                            "giving up after {} attempts",
                            backoff.attempt
                        )));
                    }
                },
            }
        }
    }

    fn description(&self) -> String {
        self.config.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(endpoint: &str) -> GraphqlConfig {
        GraphqlConfig {
            endpoint: endpoint.to_string(),
            api_key: None,
            timeout_secs: 1,
            max_attempts: 2,
        }
    }

    #[test]
    fn test_request_serialization() {
        let mut variables = Map::new();
        variables.insert("address".to_string(), json!("0xabc"));
        let request = GraphqlRequest {
            query: "query($address: String!) { user(id: $address) { id } }",
            variables: &variables,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "query": "query($address: String!) { user(id: $address) { id } }",
                "variables": {"address": "0xabc"}
            })
        );
    }

    #[test]
    fn test_response_with_data() {
        let response: GraphqlResponse =
            serde_json::from_str(r#"{"data": {"user": {"id": "1"}}}"#).unwrap();
        assert_eq!(into_data(response).unwrap(), json!({"user": {"id": "1"}}));
    }

    #[test]
    fn test_response_errors_win_over_partial_data() {
        let response: GraphqlResponse = serde_json::from_str(
            r#"{
                "data": {"user": null},
                "errors": [{"message": "not found"}, {"message": "rate limited", "path": ["user"]}]
            }"#,
        )
        .unwrap();
        let err = into_data(response).unwrap_err();
        assert_eq!(err.to_string(), "GraphQL errors: not found; rate limited");
    }

    #[test]
    fn test_response_without_data_or_errors() {
        let response: GraphqlResponse = serde_json::from_str("{}").unwrap();
        assert!(into_data(response).is_err());
    }

    #[test]
    fn test_new_rejects_invalid_endpoint() {
        assert!(GraphqlClient::new(config("ftp://example.com")).is_err());
    }

    #[test]
    fn test_description_is_endpoint() {
        let client = GraphqlClient::new(config("https://api.example.com/graphql")).unwrap();
        assert_eq!(client.description(), "https://api.example.com/graphql");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_gives_up() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let client = GraphqlClient::new(config("http://127.0.0.1:9/graphql")).unwrap();
        let err = client.fetch("query { a }", &Map::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("giving up after 2 attempts"));
    }
}
