//! Command-line interface for aggcursor
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and CLI overrides
//! - Translating flags into a pipeline and aggregate options

use bson::{Bson, Document};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::{AggregateOptions, Hint, Namespace, Pipeline};
use crate::config::Config;
use crate::error::{AggError, Result};

/// Extract database name from MongoDB connection URI
///
/// # Arguments
/// * `uri` - MongoDB connection URI
///
/// # Returns
/// * `Option<String>` - Database name if found in URI
fn extract_database_from_uri(uri: &str) -> Option<String> {
    // mongodb://[username:password@]host[:port][/database][?options]
    let after_scheme = uri.split("://").nth(1)?;
    let path_part = after_scheme.split('/').nth(1)?;
    let db_name = path_part.split('?').next().unwrap_or("");
    if db_name.is_empty() {
        None
    } else {
        Some(db_name.to_string())
    }
}

/// Run an aggregation pipeline and stream its batches
#[derive(Parser, Debug)]
#[command(
    name = "aggcursor",
    version,
    about = "Run a MongoDB aggregation and stream result batches",
    long_about = "Runs an aggregation pipeline against one collection and prints each
result batch as it arrives. Pipelines ending in $out or $merge print a
single acknowledgement instead."
)]
pub struct CliArgs {
    /// MongoDB connection URI
    ///
    /// Format: mongodb://[username:password@]host[:port][/database][?options]
    #[arg(value_name = "URI")]
    pub uri: Option<String>,

    /// Database name to use
    #[arg(long = "db", value_name = "NAME")]
    pub database: Option<String>,

    /// Collection to aggregate
    #[arg(long, value_name = "NAME")]
    pub collection: String,

    /// Pipeline as a JSON array of stages
    #[arg(long, value_name = "JSON")]
    pub pipeline: String,

    /// Documents per batch
    #[arg(long, value_name = "N")]
    pub batch_size: Option<u32>,

    /// Server-side time limit for the aggregation
    #[arg(long = "max-time-ms", value_name = "MS")]
    pub max_time_ms: Option<u64>,

    /// How long a getMore may wait for new data
    #[arg(long = "max-await-time-ms", value_name = "MS")]
    pub max_await_time_ms: Option<u64>,

    /// Allow stages to spill to disk
    #[arg(long)]
    pub allow_disk_use: bool,

    /// Skip document validation for $out / $merge
    #[arg(long)]
    pub bypass_document_validation: bool,

    /// Comment attached to the command
    #[arg(long, value_name = "TEXT")]
    pub comment: Option<String>,

    /// Index hint: a JSON key pattern or an index name
    #[arg(long, value_name = "JSON|NAME")]
    pub hint: Option<String>,

    /// Collation as a JSON document
    #[arg(long, value_name = "JSON")]
    pub collation: Option<String>,

    /// Close the cursor after this many batches
    #[arg(long, value_name = "N")]
    pub max_batches: Option<usize>,

    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv")]
    pub very_verbose: bool,
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Create a new CLI interface from the process arguments
    ///
    /// # Returns
    /// * `Result<Self>` - New CLI interface or error
    pub fn new() -> Result<Self> {
        let args = CliArgs::parse();
        let config = Config::load(args.config_file.as_deref())?;
        Ok(Self { args, config })
    }

    /// Get the MongoDB connection URI
    ///
    /// An explicit URI argument wins over the configured default.
    pub fn get_connection_uri(&self) -> String {
        self.args
            .uri
            .clone()
            .unwrap_or_else(|| self.config.connection.default_uri.clone())
    }

    /// Get the database name to use
    ///
    /// Priority:
    /// 1. --db command line argument
    /// 2. Database name from connection URI
    /// 3. Default to "test"
    pub fn get_database(&self) -> String {
        if let Some(db) = &self.args.database {
            return db.clone();
        }
        extract_database_from_uri(&self.get_connection_uri()).unwrap_or_else(|| "test".to_string())
    }

    /// Target namespace for the aggregation
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.get_database(), self.args.collection.clone())
    }

    /// Parse the `--pipeline` argument
    pub fn pipeline(&self) -> Result<Pipeline> {
        parse_pipeline(&self.args.pipeline)
    }

    /// Build aggregate options from flags
    pub fn aggregate_options(&self) -> Result<AggregateOptions> {
        let args = &self.args;
        let options = AggregateOptions {
            allow_disk_use: args.allow_disk_use.then_some(true),
            max_time: args.max_time_ms.map(Duration::from_millis),
            max_await_time: args.max_await_time_ms.map(Duration::from_millis),
            batch_size: args.batch_size,
            bypass_document_validation: args.bypass_document_validation.then_some(true),
            collation: args
                .collation
                .as_deref()
                .map(|json| parse_document("collation", json))
                .transpose()?,
            comment: args.comment.clone(),
            hint: args.hint.as_deref().map(parse_hint).transpose()?,
        };
        options.validate()?;
        Ok(options)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the CLI arguments
    pub fn args(&self) -> &CliArgs {
        &self.args
    }
}

/// Parse a JSON array of stages into a pipeline
///
/// Accepts relaxed or canonical extended JSON.
pub fn parse_pipeline(json: &str) -> Result<Pipeline> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| AggError::InvalidArgument(format!("Pipeline is not valid JSON: {}", e)))?;
    let serde_json::Value::Array(stages) = value else {
        return Err(AggError::InvalidArgument(
            "Pipeline must be a JSON array of stages".to_string(),
        ));
    };

    let stages = stages
        .into_iter()
        .enumerate()
        .map(|(i, stage)| match to_bson(stage)? {
            Bson::Document(doc) => Ok(doc),
            other => Err(AggError::InvalidArgument(format!(
                "Stage {} must be a document, got {:?}",
                i,
                other.element_type()
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Pipeline::new(stages)
}

/// Parse `--hint`: a JSON document is a key pattern, anything else an index name
pub fn parse_hint(value: &str) -> Result<Hint> {
    if value.trim_start().starts_with('{') {
        parse_document("hint", value).map(Hint::Keys)
    } else {
        Ok(Hint::Name(value.to_string()))
    }
}

fn parse_document(field: &str, json: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| AggError::InvalidArgument(format!("Invalid {} JSON: {}", field, e)))?;
    match to_bson(value)? {
        Bson::Document(doc) => Ok(doc),
        _ => Err(AggError::InvalidArgument(format!(
            "{} must be a JSON object",
            field
        ))),
    }
}

fn to_bson(value: serde_json::Value) -> Result<Bson> {
    Bson::try_from(value)
        .map_err(|e| AggError::InvalidArgument(format!("Invalid extended JSON: {}", e)))
}
