//! `ballotbox init`: write a starter config with a fresh master secret.

use std::path::PathBuf;

use crate::config;

pub fn execute(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.unwrap_or_else(super::default_config_path);
    if path.exists() {
        return Err(format!("refusing to overwrite existing config at {}", path.display()).into());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config::write_default(&path)?;
    println!("Config written to {}", path.display());
    Ok(())
}
