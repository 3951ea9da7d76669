// CLI subcommand dispatch.

use anyhow::Context;
use clap::{Args, Subcommand};
use url::Url;

use livecount_client::PresenceConfig;

pub mod config;
pub mod online;
pub mod watch;

/// Flags shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Gateway origin override for this run (persisted like `?gw=`).
    #[arg(long, global = true, value_name = "URL")]
    pub gateway: Option<String>,

    /// Page URL whose query may carry `gatewayOrigin`, `gw` or `presenceDebug`.
    #[arg(long, global = true, value_name = "URL")]
    pub page_url: Option<String>,

    /// Verbose lifecycle logging.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Force JSON output.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Follow the viewer count of a room until interrupted
    Watch(watch::WatchArgs),
    /// Follow the site-wide visitor count until interrupted
    Online(online::OnlineArgs),
    /// Show or edit ~/.livecount/config.toml
    Config(config::ConfigArgs),
}

pub fn run(cmd: Command, globals: &GlobalArgs) -> anyhow::Result<()> {
    match cmd {
        Command::Watch(args) => watch::run(args, globals),
        Command::Online(args) => online::run(args, globals),
        Command::Config(args) => config::run(args, globals),
    }
}

/// Config with the global flags folded in.
pub(crate) fn effective_config(globals: &GlobalArgs) -> PresenceConfig {
    let mut config = PresenceConfig::load();
    config.debug |= globals.debug;
    config
}

/// The page URL the service treats as its location. A `--gateway` flag is
/// carried as a `gw` query parameter so it is validated and persisted the
/// same way a page override would be.
pub(crate) fn page_url(globals: &GlobalArgs, config: &PresenceConfig) -> anyhow::Result<Url> {
    let mut url = match &globals.page_url {
        Some(raw) => Url::parse(raw).with_context(|| format!("invalid --page-url `{raw}`"))?,
        None => config.page_origin_url(),
    };
    if let Some(gateway) = &globals.gateway {
        validate_origin(gateway)?;
        url.query_pairs_mut().append_pair("gw", gateway);
    }
    Ok(url)
}

pub(crate) fn validate_origin(raw: &str) -> anyhow::Result<()> {
    let url = Url::parse(raw).with_context(|| format!("invalid gateway origin `{raw}`"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("gateway origin must start with http:// or https://, got `{raw}`");
    }
    Ok(())
}

pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}
