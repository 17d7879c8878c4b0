use std::path::PathBuf;

use anyhow::ensure;
use anyhow::Context;
use arboard::Clipboard;
use clap::Parser;
use teams_recordings_downloader_rs::auth::present_challenge;
use teams_recordings_downloader_rs::auth::DeviceCodeFlow;
use teams_recordings_downloader_rs::settings::Settings;
use teams_recordings_downloader_rs::Downloader;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Downloads meeting recordings from the files of every joined Microsoft Teams team
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Destination directory, remembered for later runs
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Graph access token; skips interactive sign-in
    #[arg(long, env = "GRAPH_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Application (client) id used for device-code sign-in
    #[arg(long, env = "TEAMS_DL_CLIENT_ID")]
    client_id: Option<String>,

    /// Directory tenant to sign in to
    #[arg(long, default_value = "organizations")]
    tenant: String,

    /// Number of concurrent requests
    #[arg(short, long, default_value_t = 4)]
    jobs: usize,

    /// Print the sign-in URL instead of opening a browser
    #[arg(long)]
    no_browser: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    ensure!(args.jobs > 0, "--jobs must be at least 1");

    let settings_path = match args.settings {
        Some(path) => path,
        None => Settings::default_path().context("Could not locate a config directory")?,
    };
    let mut settings = Settings::open(&settings_path)?;
    if let Some(output) = &args.output {
        settings.set_save_folder(output)?;
    }
    let dest = settings.save_folder()?;
    info!(path = %dest.display(), "Saving recordings");

    let token = match args.token {
        Some(token) => token,
        None => {
            let client_id = args
                .client_id
                .context("Either --token or --client-id is required")?;
            let open_browser = !args.no_browser;
            // Must outlive polling: on X11 this handle serves the copied text.
            let mut clipboard = Clipboard::new()
                .map_err(|err| warn!(error = %err, "Clipboard is unavailable"))
                .ok();
            DeviceCodeFlow::new(client_id)
                .tenant(args.tenant)
                .authenticate(|challenge| present_challenge(challenge, clipboard.as_mut(), open_browser))?
        }
    };

    let downloader = Downloader::builder()
        .dest(dest)
        .token(token)
        .jobs(args.jobs)
        .build()?;
    if let Err(err) = downloader.download_all() {
        error!(error = format!("{err:#}"), "Failed to list joined teams");
    }
    Ok(())
}
