//! Oguri
//!
//! Animated wallpaper daemon for Wayland compositors implementing the wlr
//! layer shell. Every output shows a still or animated image, reconfigurable
//! at runtime through `ogurictl`.

mod animation;
mod buffer;
mod config;
mod daemon;
mod decoder;
mod ipc;
mod output;
mod pixels;
mod shm;
mod signals;
mod state;
#[cfg(test)]
mod testing;
mod timer;
mod wayland;

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: oguri [options]

  -c <path>   Path to the configuration file
  -h          Show this text
";

/// What the command line asks for
enum Command {
    Run { config: Option<PathBuf> },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut config = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-c" => {
                let path = iter.next().context("-c requires a path")?;
                let path = config::expand_home(path).context("Unable to expand config path")?;
                config = Some(path);
            }
            other => bail!("Unknown argument '{other}'"),
        }
    }

    Ok(Command::Run { config })
}

fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => config::default_path().context("Unable to determine the config directory")?,
    };

    let configs = config::OutputConfigs::load(&config_path)
        .with_context(|| format!("Unable to load configuration {:?}", config_path))?;

    let mut daemon = daemon::Daemon::new(config_path, configs)?;
    daemon.run()
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "oguri=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match parse_args(&args) {
        Ok(Command::Run { config }) => config,
        Ok(Command::Help) => {
            print!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("{:#}", e);
            eprint!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting oguri {}", env!("CARGO_PKG_VERSION"));
    match run(config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert!(matches!(parse_args(&[]), Ok(Command::Run { config: None })));
        assert!(matches!(parse_args(&args(&["-h"])), Ok(Command::Help)));
        match parse_args(&args(&["-c", "/etc/oguri.conf"])) {
            Ok(Command::Run { config }) => assert_eq!(config, Some(PathBuf::from("/etc/oguri.conf"))),
            _ => panic!("Expected a run command"),
        }
        assert!(parse_args(&args(&["-c"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }
}
