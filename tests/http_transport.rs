#![cfg(feature = "http")]

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::Value;
use tracing_upload_sink::transport::{HttpTransport, LOG_FILE_PARAMETER};
use tracing_upload_sink::{
    DefaultUploader, DestinationConfig, DeviceInfo, Level, LogRecord, LogSink, NetworkError, ParameterEncoding,
    Registry, UploadConfig, UploadError,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry() -> Registry {
    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    let device = DeviceInfo::default().with_app_version("1.4.0", "77");
    Registry::new(Arc::new(DefaultUploader::new(Arc::new(transport), device)))
}

#[tokio::test]
async fn posts_json_body_with_headers_and_encoded_file() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logs"))
        .and(header("content-type", "application/json"))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = UploadConfig::new(format!("{}/logs", server.uri()), dir.path().join("uploads"))
        .with_headers(|| [("Authorization".to_string(), "Bearer token-1".to_string())].into_iter().collect());
    let registry = registry();
    let dest = registry
        .add_destination(DestinationConfig::json("app", dir.path().join("app.json")).with_upload(config))
        .unwrap();
    dest.sink().append(&LogRecord::new(Level::Info, "shipped"));

    registry.upload_logs("app").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["appVersion"], "1.4.0");
    let encoded = body[LOG_FILE_PARAMETER].as_str().unwrap();
    let file = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
    let records: Vec<Value> = serde_json::from_slice(&file).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["message"], "shipped");
}

#[tokio::test]
async fn form_encoding_is_supported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = UploadConfig::new(server.uri(), dir.path().join("uploads")).with_encoding(ParameterEncoding::Form);
    let registry = registry();
    let dest = registry
        .add_destination(DestinationConfig::json("app", dir.path().join("app.json")).with_upload(config))
        .unwrap();
    dest.sink().append(&LogRecord::new(Level::Warning, "form"));

    registry.upload_logs("app").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.contains(&format!("{}=", LOG_FILE_PARAMETER)));
}

#[tokio::test]
async fn unauthorized_response_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("uploads");
    let registry = registry();
    let dest = registry
        .add_destination(
            DestinationConfig::json("app", dir.path().join("app.json"))
                .with_upload(UploadConfig::new(server.uri(), &home)),
        )
        .unwrap();
    dest.sink().append(&LogRecord::new(Level::Error, "denied"));

    let result = registry.upload_logs("app").await;

    assert!(matches!(result, Err(UploadError::Network(NetworkError::Authentication))));
    assert_eq!(std::fs::read_dir(home.join("app").join("failed")).unwrap().count(), 1);
}

#[tokio::test]
async fn client_errors_keep_their_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(413))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let dest = registry
        .add_destination(
            DestinationConfig::json("app", dir.path().join("app.json"))
                .with_upload(UploadConfig::new(server.uri(), dir.path().join("uploads"))),
        )
        .unwrap();
    dest.sink().append(&LogRecord::new(Level::Info, "too big"));

    let result = registry.upload_logs("app").await;
    assert!(matches!(result, Err(UploadError::Network(NetworkError::ClientError(413)))));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    let uri = "http://127.0.0.1:1/logs";

    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let dest = registry
        .add_destination(
            DestinationConfig::json("app", dir.path().join("app.json"))
                .with_upload(UploadConfig::new(uri, dir.path().join("uploads"))),
        )
        .unwrap();
    dest.sink().append(&LogRecord::new(Level::Info, "nobody home"));

    let result = registry.upload_logs("app").await;
    assert!(matches!(result, Err(UploadError::Network(NetworkError::Connection(_)))));
}
