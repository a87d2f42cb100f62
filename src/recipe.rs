//! Recipe files — what to fetch, how to process it, what the result must look like.
//!
//! A recipe is a TOML file. The processor script and the output schema are
//! either inline or loaded from files next to the recipe.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::sandbox::RawScript;

/// One GraphQL query of a recipe.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QuerySpec {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
enum ScriptSource {
    Path(PathBuf),
    Inline(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
enum SchemaSource {
    Path(PathBuf),
    Inline(Value),
}

/// Recipe file as written on disk.
#[derive(Debug, Deserialize)]
struct RecipeFile {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    requires_address: bool,
    processor: ScriptSource,
    #[serde(default)]
    schema: Option<SchemaSource>,
    #[serde(default)]
    queries: Vec<QuerySpec>,
}

/// A recipe with its processor and schema resolved.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub description: Option<String>,
    /// Overrides the configured GraphQL endpoint
    pub endpoint: Option<String>,
    /// Refuse to run without a user address
    pub requires_address: bool,
    pub queries: Vec<QuerySpec>,
    pub processor: RawScript,
    pub schema: Option<Value>,
}

impl Recipe {
    /// Loads a recipe file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("cannot read recipe {}: {e}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let recipe = Self::parse(&content, base)?;
        debug!(
            "Loaded recipe '{}' ({} queries) from {}",
            recipe.name,
            recipe.queries.len(),
            path.display()
        );
        Ok(recipe)
    }

    /// Parses recipe TOML; `base` is the directory relative paths start from.
    pub fn parse(content: &str, base: &Path) -> Result<Self> {
        let file: RecipeFile = toml::from_str(content)?;

        let processor = match file.processor {
            ScriptSource::Inline(source) => source,
            ScriptSource::Path(path) => {
                let path = base.join(path);
                std::fs::read_to_string(&path)
                    .map_err(|e| anyhow!("cannot read processor {}: {e}", path.display()))?
            }
        };

        let schema = match file.schema {
            None => None,
            Some(SchemaSource::Inline(schema)) => Some(schema),
            Some(SchemaSource::Path(path)) => {
                let path = base.join(path);
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow!("cannot read schema {}: {e}", path.display()))?;
                let schema = serde_json::from_str(&text)
                    .map_err(|e| anyhow!("schema {} is not valid JSON: {e}", path.display()))?;
                Some(schema)
            }
        };

        let recipe = Recipe {
            name: file.name,
            description: file.description,
            endpoint: file.endpoint,
            requires_address: file.requires_address,
            queries: file.queries,
            processor: RawScript::from(processor),
            schema,
        };
        recipe.validate()?;
        Ok(recipe)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("recipe name must not be empty");
        }
        if self.processor.as_str().trim().is_empty() {
            bail!("recipe '{}' has an empty processor", self.name);
        }

        let mut seen = HashSet::new();
        for query in &self.queries {
            if query.query.trim().is_empty() {
                bail!("query '{}' of recipe '{}' is empty", query.name, self.name);
            }
            if !seen.insert(query.name.as_str()) {
                bail!("recipe '{}' declares query '{}' twice", self.name, query.name);
            }
        }
        Ok(())
    }
}
