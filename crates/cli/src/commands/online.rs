// `livecount online`: follow the site-wide visitor count.

use anyhow::Context;
use clap::Args;

use livecount_client::{LocalBus, PresenceService};

use super::GlobalArgs;
use crate::output::{self, OutputFormat, StateLine};

#[derive(Debug, Args)]
pub struct OnlineArgs {}

pub fn run(_args: OnlineArgs, globals: &GlobalArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(globals.json);
    let result = super::runtime()?.block_on(follow(globals, format));
    if let Err(e) = &result {
        output::print_error(format, "ONLINE_FAILED", &format!("{e:#}"));
    }
    result
}

async fn follow(globals: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = super::effective_config(globals);
    let page_url = super::page_url(globals, &config)?;
    let service = PresenceService::from_config(config, Some(&page_url), LocalBus::new())
        .context("failed to start presence service")?;

    let mut site = service.site_online();
    let mut last = None;
    loop {
        let state = site.state();
        if last.as_ref() != Some(&state) {
            output::print_output(format, &StateLine { scope: "site", state: &state }, output::format_state_line)?;
            last = Some(state);
        }
        tokio::select! {
            alive = site.changed() => if !alive { break },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
        }
    }
    Ok(())
}
