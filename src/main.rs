use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use voice_assist::config::Config;
use voice_assist::location::lookup_location;
use voice_assist::supervisor::{StartupError, StopHandle};
use voice_assist::{init_tracing, launch, Collaborators};

#[derive(Parser, Debug)]
#[command(name = "voice-assist", version, about = "Always-listening voice assistant")]
struct Cli {
    /// Settings file (voice name, speaker volume)
    #[arg(long, env = "VOICE_ASSIST_SETTINGS")]
    settings: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, env = "VOICE_ASSIST_LOG_JSON")]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);
    info!("voice assistant starting");

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(path) = cli.settings {
        config.settings_path = path;
    }

    let Some(location) = lookup_location(&config.location_url) else {
        error!("no internet connection or location service unavailable, stopping");
        return Err(StartupError::NoConnectivity.into());
    };
    info!(location = %location, "location detected");

    let collaborators = Collaborators::from_config(&config)?;
    let assistant = launch(&config, &location, collaborators).context("startup failed")?;
    watch_signals(assistant.stop_handle())?;

    assistant.run();
    info!("stopped");
    Ok(())
}

/// Ctrl-C requests a stop; the watchdog notices within one poll.
fn watch_signals(stop: StopHandle) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "signal runtime failed to start");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("stopping due to interrupt");
                }
            });
            stop.request_stop();
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}
