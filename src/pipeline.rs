//! Recipe pipeline: fetch → process → validate → attestation.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::query::{self, QueryClient};
use crate::recipe::Recipe;
use crate::sandbox::{ProcessorEngine, QueryResultSet};
use crate::validate::OutputValidator;

/// Per-invocation options from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Print full diagnostics on failure
    pub verbose: bool,
    /// User address passed to the recipe's queries
    pub address: Option<String>,
}

/// A validated processor result.
#[derive(Debug, Serialize)]
pub struct Attestation {
    pub recipe: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub run_id: String,
    pub generated_at: String,
    pub result: Value,
}

/// Fetches the recipe's queries through `client`, then processes them.
pub async fn run_recipe(
    engine: &ProcessorEngine,
    client: &dyn QueryClient,
    recipe: &Recipe,
    options: &RunOptions,
) -> Result<Attestation> {
    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("recipe", name = %recipe.name, run = %run_id);
    async move {
        let data = query::fetch_all(client, recipe, options.address.as_deref()).await?;
        process(engine, recipe, data, options, run_id).await
    }
    .instrument(span)
    .await
}

/// Processes already-fetched query results.
pub async fn process_results(
    engine: &ProcessorEngine,
    recipe: &Recipe,
    data: QueryResultSet,
    options: &RunOptions,
) -> Result<Attestation> {
    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("recipe", name = %recipe.name, run = %run_id);
    process(engine, recipe, data, options, run_id)
        .instrument(span)
        .await
}

async fn process(
    engine: &ProcessorEngine,
    recipe: &Recipe,
    data: QueryResultSet,
    options: &RunOptions,
    run_id: String,
) -> Result<Attestation> {
    let validator = OutputValidator::new(recipe.schema.as_ref())?;

    info!("Running processor on {} query results", data.len());
    // The isolate is not Send: it is created, used and torn down on one
    // blocking thread.
    let worker = engine.clone();
    let script = recipe.processor.clone();
    let result = tokio::task::spawn_blocking(move || worker.execute(&script, &data))
        .await
        .map_err(|e| anyhow!("processor thread failed: {e}"))??;
    debug!(
        "Sandboxes acquired: {}, torn down: {}, live: {}",
        engine.probe().acquired(),
        engine.probe().torn_down(),
        engine.probe().live()
    );

    validator.validate(&result)?;
    info!("Processor output validated");

    Ok(Attestation {
        recipe: recipe.name.clone(),
        address: options.address.clone(),
        run_id,
        generated_at: Utc::now().to_rfc3339(),
        result,
    })
}
