mod app;
mod cli;
mod compile;
mod config;
mod dbbuild;
mod dbmerge;
mod error;
mod events;
mod ledger;
mod library;
mod logging;
mod metadata;
mod mods_config;
mod refresh;
mod resolve;
mod rimworld;
mod rules;
mod steamdb;
mod store;
#[cfg(test)]
mod testing;
mod workshop;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
