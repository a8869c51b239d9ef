#![allow(clippy::unwrap_used, clippy::expect_used)]
//! `HttpMachineBackend` against a mock MAAS region API.

use std::sync::Arc;
use std::time::Duration;

use maas_async_utils::AbortSignal;
use maas_mcp_server::backend::ApiKey;
use maas_mcp_server::backend::BackendError;
use maas_mcp_server::backend::CommissionOptions;
use maas_mcp_server::backend::DeployOptions;
use maas_mcp_server::backend::HttpMachineBackend;
use maas_mcp_server::backend::MachineBackend;
use maas_mcp_server::tools::ToolCall;
use maas_mcp_server::tools::ToolRouter;
use maas_operations::OperationServices;
use maas_operations::OperationsRegistry;
use maas_operations::RateLimitHistory;
use maas_operations::RegistryConfig;
use maas_operations::RetryPolicy;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::header_exists;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;

const MACHINE_PATH: &str = "/MAAS/api/2.0/machines/abc123/";

fn machine_json(status_name: &str) -> serde_json::Value {
    json!({
        "system_id": "abc123",
        "hostname": "node-1",
        "status": 9,
        "status_name": status_name,
        "status_message": null,
        "architecture": "amd64/generic"
    })
}

fn backend(server: &MockServer) -> HttpMachineBackend {
    HttpMachineBackend::new(
        &format!("{}/MAAS", server.uri()),
        Some(ApiKey::parse("consumer:token:secret").unwrap()),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn deploy_posts_form_with_oauth_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MACHINE_PATH))
        .and(query_param("op", "deploy"))
        .and(header_exists("authorization"))
        .and(body_string_contains("distro_series=jammy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(machine_json("Deploying")))
        .expect(1)
        .mount(&server)
        .await;

    let options = DeployOptions {
        distro_series: Some("jammy".to_string()),
        ..Default::default()
    };
    let machine = backend(&server).deploy("abc123", &options).await.unwrap();

    assert_eq!(machine.system_id, "abc123");
    assert_eq!(machine.status_name, "Deploying");
}

#[tokio::test]
async fn commission_sends_flags() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MACHINE_PATH))
        .and(query_param("op", "commission"))
        .and(body_string_contains("enable_ssh=1"))
        .and(body_string_contains("skip_storage=0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(machine_json("Commissioning")))
        .expect(1)
        .mount(&server)
        .await;

    let options = CommissionOptions {
        enable_ssh: true,
        ..Default::default()
    };
    let machine = backend(&server)
        .commission("abc123", &options)
        .await
        .unwrap();
    assert_eq!(machine.status_name, "Commissioning");
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MACHINE_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("region unavailable"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/MAAS/api/2.0/machines/gone42/"))
        .respond_with(ResponseTemplate::new(404).set_body_string("No Machine matches"))
        .mount(&server)
        .await;

    let backend = backend(&server);

    let unavailable = backend.machine("abc123").await.unwrap_err();
    assert!(unavailable.is_transient());
    assert_eq!(unavailable.to_string(), "MAAS returned 503 Service Unavailable: region unavailable");

    let missing = backend.machine("gone42").await.unwrap_err();
    assert!(missing.is_not_found());
    assert!(!missing.is_transient());
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MACHINE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = backend(&server).machine("abc123").await.unwrap_err();
    assert!(matches!(err, BackendError::Decode(_)));
}

#[tokio::test]
async fn deploy_tool_retries_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MACHINE_PATH))
        .and(query_param("op", "deploy"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(MACHINE_PATH))
        .and(query_param("op", "deploy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(machine_json("Deploying")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(MACHINE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(machine_json("Deployed")))
        .mount(&server)
        .await;

    let services = OperationServices::new(
        Arc::new(OperationsRegistry::new(RegistryConfig::default())),
        Arc::new(RateLimitHistory::new()),
    )
    .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(10)));
    let router = ToolRouter::new(
        services,
        Arc::new(backend(&server)),
        Duration::from_millis(10),
    );

    let result = router
        .call(ToolCall::new(
            "deploy_machine",
            json!({"system_id": "abc123"}),
            AbortSignal::new(),
        ))
        .await
        .unwrap();

    assert!(!result.is_error, "{}", result.joined_text());
    let deploys = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method.as_str() == "POST")
        .count();
    assert_eq!(deploys, 2);
}
