use anyhow::Result;
use std::path::Path;

pub async fn run(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());
    let config = super::load_config(config_path).await?;

    println!("✓ Configuration valid");
    println!("  Register type: {:?}", config.register_type);
    println!("  Servers: {}", config.servers().join(", "));
    println!("  Root: /{}", config.root);

    if let Some(registry) = &config.service_registry {
        println!("  Naming service: {:?} (group {})", registry.flavor, registry.group);
    }
    if !config.tags.is_empty() {
        println!("  Tags: {}", config.tags.len());
    }
    Ok(())
}
