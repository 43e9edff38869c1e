//! Nacos and Consul registration over scripted HTTP

mod common;

use common::ScriptedTransport;
use coordination::SmolSpawner;
use register_client::config::ServiceRegistryConfig;
use register_client::transport::{Body, HttpResponse, Method};
use register_client::{
    AdapterFactory, MetadataRecord, RegisterConfig, RegisterType, RegistryFlavor, UriRecord,
};
use std::sync::Arc;

fn registry_config(flavor: RegistryFlavor, servers: &str) -> RegisterConfig {
    let mut config = RegisterConfig::new(RegisterType::ServiceRegistry, servers);
    config.service_registry = Some(ServiceRegistryConfig {
        flavor,
        namespace: "dev".to_string(),
        group: "DEFAULT_GROUP".to_string(),
        instance_id: Some("node1".to_string()),
        service_name: None,
        heartbeat_ms: 60_000,
        enable_tag_override: true,
        token: Some("acl-token".to_string()),
    });
    config
}

fn route(rule: &str) -> MetadataRecord {
    MetadataRecord {
        app_name: "orders".to_string(),
        context_path: "/orders".to_string(),
        path: rule.to_string(),
        rpc_type: "http".to_string(),
        rule_name: rule.to_string(),
        enabled: true,
        ..Default::default()
    }
}

fn form_field<'a>(body: &'a Body, name: &str) -> Option<&'a str> {
    match body {
        Body::Form(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str()),
        _ => None,
    }
}

#[smol_potat::test]
async fn test_nacos_registration_flow() {
    let transport = ScriptedTransport::new(|request| {
        let response = if request.url.ends_with("/nacos/v1/auth/login") {
            HttpResponse::new(200, r#"{"accessToken":"nacos-token","tokenTtl":18000}"#)
        } else if request.url.ends_with("/nacos/v1/cs/configs") {
            HttpResponse::new(200, "true")
        } else {
            HttpResponse::new(200, "ok")
        };
        Ok(response)
    });

    let mut config = registry_config(RegistryFlavor::Nacos, "nacos:8848");
    config.username = Some("nacos".to_string());
    config.password = Some("nacos".to_string());
    let adapter = AdapterFactory::new(config)
        .with_transport(transport.clone())
        .with_spawner(Arc::new(SmolSpawner))
        .build()
        .await
        .expect("Failed to build nacos adapter");
    assert_eq!(transport.requests_to("/nacos/v1/auth/login").len(), 1);

    let uri = UriRecord::http("orders", "/orders", "10.0.0.1", 8080);
    adapter.persist_uri(&uri).await.expect("register instance");
    let register = &transport.requests_to("/nacos/v1/ns/instance")[0];
    assert_eq!(register.method, Method::Post);
    assert_eq!(register.url, "http://nacos:8848/nacos/v1/ns/instance");
    assert_eq!(register.param("serviceName"), Some("shenyu.register.service.http"));
    assert_eq!(register.param("namespaceId"), Some("dev"));
    assert_eq!(register.param("ephemeral"), Some("true"));
    assert_eq!(register.param("accessToken"), Some("nacos-token"));
    let metadata: serde_json::Value =
        serde_json::from_str(register.param("metadata").expect("metadata param")).expect("metadata JSON");
    assert_eq!(metadata["contextPath"], "orders");
    let stored: UriRecord = serde_json::from_str(metadata["uriMetadata"].as_str().expect("uriMetadata"))
        .expect("uri JSON");
    assert_eq!(stored, uri);

    adapter.persist_interface(&route("/orders/list")).await.expect("publish");
    adapter.persist_interface(&route("/orders/detail")).await.expect("publish");
    let publishes = transport.requests_to("/nacos/v1/cs/configs");
    assert_eq!(publishes.len(), 2);
    let last = &publishes[1];
    assert_eq!(form_field(&last.body, "dataId"), Some("shenyu.register.service.http.orders"));
    assert_eq!(form_field(&last.body, "group"), Some("DEFAULT_GROUP"));
    assert_eq!(form_field(&last.body, "tenant"), Some("dev"));
    let published: Vec<MetadataRecord> =
        serde_json::from_str(form_field(&last.body, "content").expect("content")).expect("content JSON");
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].rule_name, "/orders/list");
    assert_eq!(published[1].rule_name, "/orders/detail");

    adapter.close().await.expect("close");
    let removals: Vec<_> = transport
        .requests_to("/nacos/v1/ns/instance")
        .into_iter()
        .filter(|r| r.method == Method::Delete)
        .collect();
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].param("ip"), Some("10.0.0.1"));
}

#[smol_potat::test]
async fn test_consul_registration_flow() {
    let transport = ScriptedTransport::new(|request| {
        if request.url.contains("/v1/kv/") {
            return Ok(HttpResponse::new(200, "true"));
        }
        Ok(HttpResponse::new(200, ""))
    });

    let adapter = AdapterFactory::new(registry_config(RegistryFlavor::Consul, "consul:8500"))
        .with_transport(transport.clone())
        .with_spawner(Arc::new(SmolSpawner))
        .build()
        .await
        .expect("Failed to build consul adapter");

    let uri = UriRecord::http("orders", "/orders", "10.0.0.1", 8080);
    adapter.persist_uri(&uri).await.expect("register service");
    let register = &transport.requests_to("/v1/agent/service/register")[0];
    assert_eq!(register.method, Method::Put);
    assert_eq!(register.header_value("X-Consul-Token"), Some("acl-token"));
    let body = common::json_body(register);
    assert_eq!(body["ID"], "shenyu-register-service-http-node1-10-0-0-1-8080");
    assert_eq!(body["Name"], "shenyu-register-service-http");
    assert_eq!(body["Address"], "10.0.0.1");
    assert_eq!(body["Port"], 8080);
    assert_eq!(body["EnableTagOverride"], true);
    assert_eq!(body["Meta"]["contextPath"], "orders");

    adapter.persist_interface(&route("/orders/list")).await.expect("publish");
    let put = &transport.requests_to("/v1/kv/shenyu.register.service.http.orders")[0];
    match &put.body {
        Body::Text(content) => {
            let published: Vec<MetadataRecord> = serde_json::from_str(content).expect("content JSON");
            assert_eq!(published[0].rule_name, "/orders/list");
        }
        other => panic!("expected text body, got {:?}", other),
    }

    adapter.close().await.expect("close");
    assert_eq!(
        transport
            .requests_to("/v1/agent/service/deregister/shenyu-register-service-http-node1-10-0-0-1-8080")
            .len(),
        1
    );
}

#[smol_potat::test]
async fn test_unreachable_server_fails_over() {
    let transport = ScriptedTransport::new(|request| {
        if request.url.starts_with("http://nacos-a:8848") {
            return Err(register_client::Error::Transport("connection refused".to_string()));
        }
        Ok(HttpResponse::new(200, "ok"))
    });

    let adapter = AdapterFactory::new(registry_config(RegistryFlavor::Nacos, "nacos-a:8848,nacos-b:8848"))
        .with_transport(transport.clone())
        .with_spawner(Arc::new(SmolSpawner))
        .build()
        .await
        .expect("Failed to build nacos adapter");

    let uri = UriRecord::http("orders", "/orders", "10.0.0.1", 8080);
    adapter.persist_uri(&uri).await.expect("register through second server");
    let attempts = transport.requests_to("/nacos/v1/ns/instance");
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1].url.starts_with("http://nacos-b:8848"));
}
