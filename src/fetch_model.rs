//! Entrypoint to download a model for offline serving

use imgserve::config::Settings;
use imgserve::fetch::fetch_model;
use imgserve::util::init_tracing;
use std::path::PathBuf;
use std::{env, process};
use tracing::info;

const USAGE: &str = "usage: ./fetch-model [model id] [output dir]

The model repo must publish a TorchScript `model.pt` (export it with
`torch.jit.trace(model, example).save(\"model.pt\")`) next to its
`config.json` and `preprocessor_config.json`.";

/// Apply the optional positional `[model id] [output dir]` arguments on top
/// of the loaded settings. `None` when there are too many arguments
fn get_args(args: &[String], mut settings: Settings) -> Option<Settings> {
    if args.len() > 2 {
        return None;
    }

    if let Some(model_id) = args.first() {
        settings.fetch.model_id = model_id.clone();
    }
    if let Some(dir) = args.get(1) {
        settings.model_dir = PathBuf::from(dir);
    }

    Some(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(settings) = get_args(&args, Settings::load()?) else {
        println!("{USAGE}");
        process::exit(1);
    };

    let files = fetch_model(&settings.fetch, &settings.model_dir).await?;
    info!(
        "saved {} files for {} to {}",
        files.len(),
        settings.fetch.model_id,
        settings.model_dir.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_args_keeps_settings() {
        let settings = get_args(&[], Settings::default()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_model_id_arg() {
        let settings = get_args(&args(&["microsoft/resnet-50"]), Settings::default()).unwrap();
        assert_eq!(settings.fetch.model_id, "microsoft/resnet-50");
        assert_eq!(settings.model_dir, Settings::default().model_dir);
    }

    #[test]
    fn test_model_id_and_dir_args() {
        let settings = get_args(
            &args(&["microsoft/resnet-50", "/tmp/resnet"]),
            Settings::default(),
        )
        .unwrap();
        assert_eq!(settings.fetch.model_id, "microsoft/resnet-50");
        assert_eq!(settings.model_dir, PathBuf::from("/tmp/resnet"));
        // untouched keys come from the loaded settings
        assert_eq!(settings.fetch.revision, "main");
    }

    #[test]
    fn test_too_many_args() {
        assert!(get_args(&args(&["a/b", "/tmp/x", "extra"]), Settings::default()).is_none());
    }

    #[test]
    fn test_usage_mentions_torchscript() {
        assert!(USAGE.contains("TorchScript"));
        assert!(USAGE.contains("model.pt"));
    }
}
