use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_upload_sink::{
    env::upload_config_from_env,
    init::init_tracing,
    transport::HttpTransport,
    DefaultUploader, DestinationConfig, DeviceInfo, Registry,
};

/// Uploads the log file of one destination to the endpoint named by
/// `LOG_UPLOAD_URL`, staging files below `LOG_UPLOAD_HOME`.
///
/// ```text
/// LOG_UPLOAD_URL=http://localhost:8080/logs LOG_UPLOAD_HOME=/tmp/uploads \
///     cargo run --example http_upload
/// ```
#[tokio::main]
async fn main() {
    let config = match upload_config_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let transport = HttpTransport::new(config.request_timeout).expect("http client");
    let device = DeviceInfo::current().with_app_version(env!("CARGO_PKG_VERSION"), "dev");
    let registry = Registry::new(Arc::new(DefaultUploader::new(Arc::new(transport), device)));

    let live = config.uploader_home.join("live").join("app.json");
    registry
        .add_destination(DestinationConfig::json("app", live).with_upload(config))
        .expect("register destination");
    init_tracing(&registry).expect("install subscriber");

    info!("http upload example started");
    warn!(attempt = 1, "disk almost full");
    error!(service = "billing", "simulated error shipped via http upload");

    match registry.upload_logs("app").await {
        Ok(()) => println!("uploaded"),
        Err(e) => println!("upload failed: {}, file kept for retry", e),
    }
    for entry in registry.retry_all_failed().await {
        println!("retry {}", entry);
    }

    registry.shutdown().await;
}
