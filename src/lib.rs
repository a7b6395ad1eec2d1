/// Settings and compile-time constants shared by the server and `fetch-model`
pub mod config;

/// Model registry downloads
pub mod fetch;

/// TorchScript classifier and the `Predictor` wrapped around it
pub mod model;
pub mod preprocess;

/// Upload form and prediction routes
pub mod server;

/// Logging setup shared by both binaries
pub mod util {
    use tracing_subscriber::EnvFilter;

    /// Install the global fmt subscriber. `RUST_LOG` wins over the built-in
    /// default filter
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(super::config::RUST_LOG));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
