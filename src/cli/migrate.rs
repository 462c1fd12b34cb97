//! `ballotbox migrate`: apply the schema and exit.

use std::path::PathBuf;

use crate::config::AppConfig;
use crate::store::PollStore;

pub async fn execute(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path.unwrap_or_else(super::default_config_path);
    let config = AppConfig::load(&config_path)?;

    let store = PollStore::open(&config.database.path).await?;
    store.migrate().await?;
    println!("Schema applied to {}", config.database.path.display());
    Ok(())
}
