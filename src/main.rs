mod config;
mod pipeline;
mod query;
mod recipe;
mod sandbox;
mod validate;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::pipeline::{Attestation, RunOptions};
use crate::query::GraphqlClient;
use crate::recipe::Recipe;
use crate::sandbox::{ProcessorEngine, QueryResultSet, SandboxError};
use crate::validate::OutputValidator;

#[derive(Parser, Debug)]
#[command(
    name = "attestor",
    version,
    about = "Runs attestation recipes: fetch GraphQL data, transform it in a sandboxed processor, validate the result",
    after_help = "ENVIRONMENT VARIABLES:\n    \
        RUST_LOG    Log level filter for tracing (e.g. debug, attestor=debug,warn)\n\n\
        Variables are referenced in the config file via ${VAR_NAME} syntax."
)]
struct Cli {
    /// Path to TOML configuration file [default: attestor.toml if present]
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Debug logging and full error diagnostics
    #[arg(long, short, global = true)]
    verbose: bool,

    /// User address passed to recipe queries as `$address`
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the recipe's queries, run its processor and print the attestation
    Run {
        /// Path to the recipe TOML file
        recipe: PathBuf,
    },
    /// Run the recipe's processor on query results read from a JSON file
    Process {
        /// Path to the recipe TOML file
        recipe: PathBuf,
        /// JSON array of query results, one element per query
        #[arg(long)]
        data: PathBuf,
    },
    /// Load a recipe and compile its schema without running anything
    Check {
        /// Path to the recipe TOML file
        recipe: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the attestation and processor console output
    let default_filter = if cli.verbose { "attestor=debug" } else { "attestor=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = RunOptions {
        verbose: cli.verbose,
        address: cli.address.clone(),
    };

    match dispatch(cli, &options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e, &options);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli, options: &RunOptions) -> Result<()> {
    let config = Config::discover(cli.config.as_deref())?;

    match cli.command {
        Command::Run { recipe } => {
            let recipe = Recipe::load(&recipe)?;
            let graphql = config
                .graphql
                .as_ref()
                .ok_or_else(|| anyhow!("no [graphql] endpoint configured"))?;
            let graphql = match &recipe.endpoint {
                Some(endpoint) => graphql.with_endpoint(endpoint),
                None => graphql.clone(),
            };
            let client = GraphqlClient::new(graphql)?;
            let engine = ProcessorEngine::new(&config.sandbox);
            let attestation = pipeline::run_recipe(&engine, &client, &recipe, options).await?;
            print_attestation(&attestation)
        }
        Command::Process { recipe, data } => {
            let recipe = Recipe::load(&recipe)?;
            let content = tokio::fs::read_to_string(&data)
                .await
                .map_err(|e| anyhow!("cannot read {}: {e}", data.display()))?;
            let results: QueryResultSet = serde_json::from_str(&content)
                .map_err(|e| anyhow!("{} is not a JSON array: {e}", data.display()))?;
            let engine = ProcessorEngine::new(&config.sandbox);
            let attestation = pipeline::process_results(&engine, &recipe, results, options).await?;
            print_attestation(&attestation)
        }
        Command::Check { recipe } => {
            let recipe = Recipe::load(&recipe)?;
            OutputValidator::new(recipe.schema.as_ref())?;
            info!(
                "Recipe '{}' OK: {} queries, schema {}",
                recipe.name,
                recipe.queries.len(),
                if recipe.schema.is_some() { "compiled" } else { "absent" }
            );
            if let Some(description) = &recipe.description {
                info!("{description}");
            }
            Ok(())
        }
    }
}

fn print_attestation(attestation: &Attestation) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(attestation)?);
    Ok(())
}

/// Prints the error category and message; the stack trace too when verbose.
fn report(e: &anyhow::Error, options: &RunOptions) {
    match e.downcast_ref::<SandboxError>() {
        Some(sandbox_error) => {
            eprintln!("error: {}: {sandbox_error}", sandbox_error.category());
            if options.verbose {
                if let Some(detail) = sandbox_error.detail() {
                    eprintln!("{detail}");
                }
            }
        }
        None => {
            if options.verbose {
                eprintln!("error: {e:?}");
            } else {
                eprintln!("error: {e:#}");
            }
        }
    }
}
