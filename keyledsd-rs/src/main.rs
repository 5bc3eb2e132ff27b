/* keyledsd: per-key RGB lighting daemon for Logitech HID++ 2.0 keyboards. */

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use keyledsd::config::{self, Config};
use keyledsd::service::{Service, ServiceOptions};

#[derive(Parser)]
#[command(name = "keyledsd", version, about = "Per-key RGB lighting daemon for Logitech keyboards")]
struct Cli {
    /// Configuration file path (default: per-user then /etc).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exit once the last device is removed.
    #[arg(long = "auto-quit")]
    auto_quit: bool,

    /// Increase verbosity (repeat for debug output).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("keyledsd={default}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_config(cli_path: Option<PathBuf>) -> anyhow::Result<(PathBuf, Config)> {
    if let Some(path) = cli_path {
        let config = Config::load(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        return Ok((path, config));
    }
    for path in config::default_config_paths() {
        if path.exists() {
            let config = Config::load(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            return Ok((path, config));
        }
    }
    /* no configuration file is not an error: run with defaults */
    Ok((PathBuf::from("/etc/keyledsd.yaml"), Config::default()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (config_path, config) = match resolve_config(cli.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    let auto_quit = cli.auto_quit || config.auto_quit;
    let mut service = Service::new(
        ServiceOptions { config_path, auto_quit },
        config,
    );

    match service.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
