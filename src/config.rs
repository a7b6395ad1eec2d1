//! imgserve configuration. Compile-time constants live at the top of the
//! module; everything an operator may want to change is in `Settings`, which
//! is layered from defaults, an optional `imgserve.toml` and `IMGSERVE_*`
//! environment variables.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Default tracing filter when `RUST_LOG` is unset
pub const RUST_LOG: &str = "imgserve=debug,actix_web=info,actix_server=info";

/// Default cap on an uploaded image
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// TorchScript module holding the classifier. Registry repos usually publish
/// `model.safetensors`; the model has to be exported with `torch.jit.trace`
/// and uploaded under this name before `fetch-model` can use it
pub const MODEL_FILE: &str = "model.pt";

/// Architecture config, carries `id2label`
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// Image processor parameters
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

/// Body returned by `/predict` when the form has no image
pub const NO_IMAGE_MESSAGE: &str = "No image uploaded. Please upload a valid image.";

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_VAR: &str = "IMGSERVE_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "imgserve";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory written by `fetch-model` and read by the server
    pub model_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Number of actix workers, defaults to the number of cores
    pub workers: Option<usize>,
    /// Run the model on CUDA when a device is available
    pub use_cuda: bool,
    pub max_upload_bytes: usize,
    pub fetch: FetchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            model_dir: PathBuf::from("./model"),
            host: "0.0.0.0".into(),
            port: 8080,
            workers: None,
            use_cuda: false,
            max_upload_bytes: MAX_UPLOAD_BYTES,
            fetch: FetchSettings::default(),
        }
    }
}

/// Where `fetch-model` downloads artifacts from. `model_id` must name a repo
/// that ships a TorchScript `model.pt` next to its configs
#[derive(Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchSettings {
    pub model_id: String,
    pub registry_url: String,
    pub revision: String,
    pub files: Vec<String>,
    pub token: Option<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchSettings {
            model_id: "Falconsai/nsfw_image_detection".into(),
            registry_url: "https://huggingface.co".into(),
            revision: "main".into(),
            files: vec![
                MODEL_CONFIG_FILE.into(),
                PREPROCESSOR_CONFIG_FILE.into(),
                MODEL_FILE.into(),
            ],
            token: None,
        }
    }
}

impl std::fmt::Debug for FetchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSettings")
            .field("model_id", &self.model_id)
            .field("registry_url", &self.registry_url)
            .field("revision", &self.revision)
            .field("files", &self.files)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Settings {
    /// Load settings from `imgserve.toml` (or `$IMGSERVE_CONFIG`) and the
    /// environment. Both sources are optional
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::from_sources(File::with_name(&file).required(false))
    }

    fn from_sources<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("IMGSERVE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }

    /// The socket address the server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
