use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use tracing_upload_sink::init::{init_tracing_with_config, LayerConfig};
use tracing_upload_sink::transport::StubTransport;
use tracing_upload_sink::{DefaultUploader, DestinationConfig, DeviceInfo, Registry, UploadConfig};

#[tokio::main]
async fn main() {
    let dir = tempfile::tempdir().expect("temp dir");
    let stub = Arc::new(StubTransport::new(200));
    let uploader = DefaultUploader::new(stub.clone(), DeviceInfo::current());
    let registry = Registry::new(Arc::new(uploader));

    let config = UploadConfig::new("http://localhost/logs", dir.path().join("uploads"));
    registry
        .add_destination(DestinationConfig::json("load", dir.path().join("load.json")).with_upload(config))
        .expect("register destination");
    init_tracing_with_config(
        &registry,
        LayerConfig {
            enable_stdout: false,
            ..LayerConfig::default()
        },
    )
    .expect("install subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "upload load test error");
    }

    let elapsed = start.elapsed();
    println!("append: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let start = Instant::now();
    let result = registry.upload_logs("load").await;
    let request = stub.requests().pop();
    println!("upload: {:?} in {:?}, body {} bytes",
        result,
        start.elapsed(),
        request.map(|r| r.body.len()).unwrap_or(0)
    );

    registry.shutdown().await;
}
