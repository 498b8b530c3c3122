//! `rsystemd`: the shell-pool dispatcher daemon (`# 4.4`).
//!
//! Boots N background shells per `RSYSD_SHELLS`, binds a Unix domain
//! socket at `RSYS_SOCKET_PATH`, and serves `rsystem()` clients until
//! killed.

use rsystemd::{config, dispatcher};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let affinities = config::parse_shell_affinities(
        &std::env::var("RSYSD_SHELLS").unwrap_or_default(),
    )
    .map_err(|e| anyhow::anyhow!("invalid RSYSD_SHELLS: {e}"))?;

    pdip::configure(pdip::ReaperMode::Internal, 0)?;

    let socket_path = config::socket_path();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move { dispatcher::run(&socket_path, affinities).await })?;
    Ok(())
}
