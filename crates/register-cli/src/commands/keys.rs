use anyhow::Result;
use register_client::transport::base_url;
use register_client::{MetadataRecord, PathBuilder, RegisterConfig, RegisterType, UriRecord};
use std::path::Path;

pub async fn run(config_path: &Path, routes_path: &Path) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let routes = super::load_routes(routes_path).await?;
    let paths = config.path_builder()?;

    for record in &routes.metadata {
        match metadata_target(&config, &paths, record) {
            Ok(target) => println!("{}", target),
            Err(e) => println!("✗ metadata {}: {}", record.path, e),
        }
    }
    for record in &routes.uris {
        match uri_target(&config, &paths, record) {
            Ok(target) => println!("{}", target),
            Err(e) => println!("✗ uri {}:{}: {}", record.host, record.port, e),
        }
    }
    Ok(())
}

fn metadata_target(
    config: &RegisterConfig,
    paths: &PathBuilder,
    record: &MetadataRecord,
) -> register_client::Result<String> {
    Ok(match config.register_type {
        RegisterType::Tree | RegisterType::KvLease => paths.metadata_key(record)?.to_string(),
        RegisterType::ServiceRegistry => {
            let context = if record.context_path.is_empty() {
                &record.app_name
            } else {
                &record.context_path
            };
            format!(
                "config {} [{}]",
                paths.build_service_config_name(&record.rpc_type, context)?,
                paths.build_metadata_node_name(record)?
            )
        }
        RegisterType::Http => posts(config, &config.http.metadata_path),
    })
}

fn uri_target(config: &RegisterConfig, paths: &PathBuilder, record: &UriRecord) -> register_client::Result<String> {
    Ok(match config.register_type {
        RegisterType::Tree | RegisterType::KvLease => paths.uri_key(record)?.to_string(),
        RegisterType::ServiceRegistry => {
            let service = match config.service_registry.as_ref().and_then(|r| r.service_name.clone()) {
                Some(name) => name,
                None => paths.build_service_instance_name(&record.rpc_type)?,
            };
            format!(
                "instance {} {}",
                service,
                paths.build_uri_node_name(&record.host, record.port)?
            )
        }
        RegisterType::Http => posts(config, &config.http.uri_path),
    })
}

fn posts(config: &RegisterConfig, path: &str) -> String {
    config
        .servers()
        .iter()
        .map(|server| format!("POST {}{}", base_url(server), path))
        .collect::<Vec<_>>()
        .join("\n")
}
