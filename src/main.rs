//! aggcursor - run an aggregation and stream its batches
//!
//! Runs one aggregation pipeline against a collection and prints each result
//! document as relaxed extended JSON, one per line, as batches arrive.
//!
//! # Usage
//!
//! ```bash
//! aggcursor mongodb://localhost:27017 --db shop --collection orders \
//!     --pipeline '[{"$match": {"status": "A"}}]' --batch-size 100
//! ```

use std::sync::Arc;

use bson::{Bson, Document};
use tracing::{Level, debug, info};

use aggcursor::cli::CliInterface;
use aggcursor::connection::ConnectionManager;
use aggcursor::error::{Result, extract_error_info};
use aggcursor::{AggregateExecutor, AggregateOutcome, AsyncBatchCursor};

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        match extract_error_info(&e).to_json_compact() {
            Ok(json) => eprintln!("{}", json),
            Err(_) => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

/// Main application logic
///
/// 1. Parse command-line arguments and load configuration
/// 2. Initialize logging
/// 3. Connect and run the aggregation
/// 4. Print results until the cursor is exhausted or interrupted
async fn run() -> Result<()> {
    let cli = CliInterface::new()?;
    initialize_logging(&cli);

    // Reject bad input before connecting
    let pipeline = cli.pipeline()?;
    let options = cli.aggregate_options()?;

    let mut conn_manager =
        ConnectionManager::new(cli.get_connection_uri(), cli.config().connection.clone());
    conn_manager.connect().await?;

    let executor = AggregateExecutor::new(Arc::new(conn_manager.channel()?), cli.namespace())
        .with_cursor_config(cli.config().cursor.clone());

    let result = match executor.execute(pipeline.into_stages(), &options).await {
        Ok(AggregateOutcome::Written(ack)) => {
            println!(
                "{}",
                serde_json::json!({
                    "ok": 1,
                    "namespace": ack.namespace.to_string(),
                    "stage": format!("{:?}", ack.stage),
                    "elapsedMs": ack.elapsed_ms,
                })
            );
            Ok(())
        }
        Ok(AggregateOutcome::Cursor(cursor)) => {
            drain_cursor(&cursor, cli.args().max_batches).await
        }
        Err(e) => Err(e),
    };

    // killCursors is best effort; one not yet sent at shutdown is left to
    // the server's cursor timeout
    conn_manager.disconnect().await?;
    result
}

/// Print batches until the cursor ends, the batch limit is hit, or Ctrl+C
async fn drain_cursor(cursor: &AsyncBatchCursor, max_batches: Option<usize>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut batches = 0usize;
    loop {
        if max_batches.is_some_and(|max| batches >= max) {
            info!("Stopping after {} batches", batches);
            cursor.close();
            break;
        }

        tokio::select! {
            batch = cursor.next() => match batch? {
                Some(batch) => {
                    batches += 1;
                    debug!("Batch {} with {} documents", batches, batch.len());
                    for doc in batch {
                        println!("{}", to_json_line(doc));
                    }
                }
                None => break,
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, closing cursor");
                cursor.close();
                break;
            }
        }
    }

    info!("Received {} batches", batches);
    Ok(())
}

fn to_json_line(doc: Document) -> String {
    Bson::Document(doc).into_relaxed_extjson().to_string()
}

/// Initialize logging system based on verbosity level
///
/// # Arguments
/// * `cli` - CLI interface with verbosity settings
fn initialize_logging(cli: &CliInterface) {
    let level = if cli.args().very_verbose {
        Level::TRACE
    } else if cli.args().verbose {
        Level::DEBUG
    } else {
        cli.config().logging.level.to_tracing_level()
    };

    // Logs go to stderr so stdout carries only results
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
