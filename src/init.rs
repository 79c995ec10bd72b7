use crate::layer::UploadLogLayer;
use crate::record::Level;
use crate::registry::Registry;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;

/// Configuration of the logging layer.
///
/// **Fields**
/// - `min_level`: lowest [`Level`] written to the destinations.
/// - `enable_stdout`: when `true`, a `tracing_subscriber::fmt` layer is
///   installed next to [`UploadLogLayer`] so events are also printed.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub min_level: Level,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            min_level: Level::Debug,
            enable_stdout: true,
        }
    }
}

/// Install a global `tracing` subscriber that writes events into every
/// destination of `registry`.
///
/// Destinations added afterwards are not picked up; register them first.
pub fn init_tracing_with_config(registry: &Registry, config: LayerConfig) -> Result<(), SetGlobalDefaultError> {
    let layer = UploadLogLayer::new(registry.sinks(), config.min_level);

    // The two variants differ in type, so each gets its own subscriber.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = tracing_subscriber::registry().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::set_global_default(subscriber)
    }
}

/// Equivalent to [`init_tracing_with_config`] with [`LayerConfig::default`].
pub fn init_tracing(registry: &Registry) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(registry, LayerConfig::default())
}
