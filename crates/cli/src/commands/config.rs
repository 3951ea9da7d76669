// `livecount config`: inspect and edit the client config file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;

use livecount_client::config::global_config_path;
use livecount_client::PresenceConfig;

use super::GlobalArgs;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Persist the default gateway origin
    SetOrigin {
        /// Origin such as `https://gw.example.com`.
        url: String,
    },
}

#[derive(Debug, Serialize)]
struct OriginSaved {
    gateway_origin: String,
    path: PathBuf,
}

pub fn run(args: ConfigArgs, globals: &GlobalArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(globals.json);
    match args.action {
        ConfigAction::Show => {
            let config = super::effective_config(globals);
            output::print_output(format, &config, |c| {
                toml::to_string_pretty(c).unwrap_or_else(|e| format!("<unprintable config: {e}>"))
            })?;
        }
        ConfigAction::SetOrigin { url } => {
            let path = global_config_path().context("could not determine home directory")?;
            let saved = set_origin(&path, &url)?;
            output::print_output(format, &saved, |s| {
                format!("gateway_origin = {} ({})", s.gateway_origin, s.path.display())
            })?;
        }
    }
    Ok(())
}

fn set_origin(path: &Path, url: &str) -> anyhow::Result<OriginSaved> {
    super::validate_origin(url)?;
    let mut config = if path.exists() {
        PresenceConfig::load_from(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    } else {
        PresenceConfig::default()
    };
    config.gateway_origin = Some(url.trim_end_matches('/').to_string());
    config.save_to(path).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(OriginSaved {
        gateway_origin: config.gateway_origin.unwrap_or_default(),
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_origin_creates_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let saved = set_origin(&path, "https://gw.example.com/").unwrap();
        assert_eq!(saved.gateway_origin, "https://gw.example.com");

        let loaded = PresenceConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway_origin.as_deref(), Some("https://gw.example.com"));
    }

    #[test]
    fn set_origin_keeps_other_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = PresenceConfig::default();
        config.timing.poll_interval_ms = 4000;
        config.save_to(&path).unwrap();

        set_origin(&path, "http://localhost:8787").unwrap();
        let loaded = PresenceConfig::load_from(&path).unwrap();
        assert_eq!(loaded.timing.poll_interval_ms, 4000);
        assert_eq!(loaded.gateway_origin.as_deref(), Some("http://localhost:8787"));
    }

    #[test]
    fn set_origin_rejects_websocket_scheme() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert!(set_origin(&path, "wss://gw.example.com").is_err());
        assert!(!path.exists());
    }
}
