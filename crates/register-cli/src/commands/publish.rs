use anyhow::{Context, Result, bail};
use register_client::register_routes;
use std::path::Path;
use tracing::info;

pub async fn run(config_path: &Path, routes_path: &Path, hold: bool) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let routes = super::load_routes(routes_path).await?;
    info!(
        "Publishing {} metadata and {} uri records",
        routes.metadata.len(),
        routes.uris.len()
    );

    let adapter = register_client::init(config)
        .await
        .context("Failed to initialize registration")?;
    let report = register_routes(adapter.as_ref(), &routes.metadata, &routes.uris).await;

    println!(
        "✓ Published {} metadata and {} uri records",
        report.metadata_published, report.uris_published
    );
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.description, failure.error);
    }

    if hold {
        println!("Holding registration, press Ctrl-C to release");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    adapter.close().await.context("Failed to close registration")?;

    if !report.is_complete() {
        bail!("{} records failed to register", report.failures.len());
    }
    Ok(())
}
