// `livecount watch <room>`: follow one room's presence.

use anyhow::Context;
use clap::Args;
use tracing::info;

use livecount_client::{LocalBus, PresenceService, Room};

use super::GlobalArgs;
use crate::output::{self, OutputFormat, StateLine};

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Room key, typically a page path (e.g. `/blog/post-1`).
    pub room: String,
}

pub fn run(args: WatchArgs, globals: &GlobalArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(globals.json);
    let result = super::runtime()?.block_on(watch(args, globals, format));
    if let Err(e) = &result {
        output::print_error(format, "WATCH_FAILED", &format!("{e:#}"));
    }
    result
}

async fn watch(args: WatchArgs, globals: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = super::effective_config(globals);
    let page_url = super::page_url(globals, &config)?;
    let service = PresenceService::from_config(config, Some(&page_url), LocalBus::new())
        .context("failed to start presence service")?;
    let room = Room::new(args.room);
    info!(room = %room, gateway = service.gateway_origin(), "watching room");

    let mut handle = service.acquire(room.clone());
    let mut last = None;
    loop {
        let state = handle.state();
        if last.as_ref() != Some(&state) {
            let line = StateLine { scope: room.as_str(), state: &state };
            output::print_output(format, &line, output::format_state_line)?;
            last = Some(state);
        }
        tokio::select! {
            alive = handle.changed() => if !alive { break },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
        }
    }
    handle.release();
    service.shutdown();
    Ok(())
}
