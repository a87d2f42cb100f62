//! Query fetching — turns a recipe's queries into a query result set.
//!
//! Clients implement [`QueryClient`] so the pipeline can run against a real
//! GraphQL endpoint or an in-memory fake.

pub mod backoff;
pub mod graphql;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::recipe::Recipe;
use crate::sandbox::QueryResultSet;

pub use graphql::GraphqlClient;

/// Variable name the user address is passed under.
pub const ADDRESS_VARIABLE: &str = "address";

/// Abstraction over data sources for recipe queries.
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Runs one query and returns its `data` payload.
    async fn fetch(&self, query: &str, variables: &Map<String, Value>) -> Result<Value>;

    /// Human-readable description of the source, e.g. the endpoint URL.
    fn description(&self) -> String;
}

/// Runs every query of `recipe` in declaration order.
///
/// `address`, when given, becomes the `address` variable of each query
/// that does not set one itself.
pub async fn fetch_all(
    client: &dyn QueryClient,
    recipe: &Recipe,
    address: Option<&str>,
) -> Result<QueryResultSet> {
    if recipe.requires_address && address.is_none() {
        bail!("recipe '{}' requires an address (--address)", recipe.name);
    }

    info!(
        "Fetching {} queries from {}",
        recipe.queries.len(),
        client.description()
    );

    let mut results = Vec::with_capacity(recipe.queries.len());
    for query in &recipe.queries {
        let mut variables = query.variables.clone();
        if let Some(address) = address {
            variables
                .entry(ADDRESS_VARIABLE)
                .or_insert_with(|| Value::String(address.to_string()));
        }

        debug!("Running query '{}'", query.name);
        let data = client
            .fetch(&query.query, &variables)
            .await
            .map_err(|e| anyhow::anyhow!("query '{}' failed: {e}", query.name))?;
        results.push(data);
    }
    Ok(results)
}
