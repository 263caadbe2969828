mod app;
mod args;

use anyhow::Context;
use clap::Parser;
use common::{
    storage::{db::SurrealDbClient, pool::StorePools, store::StorageManager},
    utils::config::get_config,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{app::App, args::Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the JSON result
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config().context("loading configuration")?;

    let pools = StorePools::from_config(&config)?;
    {
        let db = pools.relational.acquire().await?;
        ensure_schema(&db, &config.dense_index_table, &config.sparse_index_table).await?;
    }

    let storage = StorageManager::new(&config)
        .await
        .context("opening corpus storage")?;
    info!(storage = ?storage.backend_kind(), "Index stores ready");

    let app = App::new(config, &pools, storage)?;
    match app.run(cli.command).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Command failed");
            Err(err)
        }
    }
}

async fn ensure_schema(
    db: &SurrealDbClient,
    dense_table: &str,
    sparse_table: &str,
) -> anyhow::Result<()> {
    db.ensure_initialized(dense_table, sparse_table)
        .await
        .context("defining index tables")
}
