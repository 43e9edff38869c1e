pub mod keys;
pub mod publish;
pub mod validate;

use anyhow::{Context, Result};
use register_client::{RegisterConfig, RouteSet};
use std::path::Path;

pub async fn load_config(path: &Path) -> Result<RegisterConfig> {
    RegisterConfig::from_file(path)
        .await
        .with_context(|| format!("Failed to load configuration {}", path.display()))
}

pub async fn load_routes(path: &Path) -> Result<RouteSet> {
    RouteSet::from_file(path)
        .await
        .with_context(|| format!("Failed to load routes {}", path.display()))
}
