mod commands;

use anyhow::{bail, Context, Result};
use lumensync_core::{log_info, Config, VcpFeature};
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
enum Command {
    List,
    Refresh,
    Set { target: String, value: f64, feature: VcpFeature },
    Average { ids: Vec<String> },
    DebugExport { path: Option<PathBuf> },
    Watch,
    Help,
}

const USAGE: &str = "\
usage: lumensync [--stream-logs] <command>

commands:
  list                              show known monitors
  refresh                           re-enumerate displays now
  set <id|all> <0-100> [--contrast] set brightness (or contrast)
  average <id>...                   average brightness of the given monitors
  debug-export [path]               write the identity pipeline report as JSON
  watch                             keep monitors in sync until 'q' or end of input";

fn parse_args(args: &[String]) -> Result<(Command, bool)> {
    let stream_logs = args.iter().any(|a| a == "--stream-logs");
    let contrast = args.iter().any(|a| a == "--contrast");
    let positional: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| !a.starts_with("--"))
        .collect();

    let command = match positional.as_slice() {
        [] | ["help"] => Command::Help,
        ["list"] => Command::List,
        ["refresh"] => Command::Refresh,
        ["set", target, value] => {
            let value: f64 = value
                .parse()
                .with_context(|| format!("'{}' is not a number", value))?;
            if !(0.0..=100.0).contains(&value) {
                bail!("value must be between 0 and 100, got {}", value);
            }
            let feature = if contrast { VcpFeature::Contrast } else { VcpFeature::Brightness };
            Command::Set { target: target.to_string(), value, feature }
        }
        ["average", ids @ ..] if !ids.is_empty() => Command::Average {
            ids: ids.iter().map(|s| s.to_string()).collect(),
        },
        ["debug-export"] => Command::DebugExport { path: None },
        ["debug-export", path] => Command::DebugExport { path: Some(PathBuf::from(path)) },
        ["watch"] => Command::Watch,
        other => bail!("unrecognised arguments: {}\n\n{}", other.join(" "), USAGE),
    };

    Ok((command, stream_logs))
}

fn main() -> Result<()> {
    let result = run_app();
    let _ = lumensync_core::logger::finalize_logs();
    result
}

fn run_app() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, stream_logs) = parse_args(&args)?;

    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::new()?;
    let settings = config.load()?;

    lumensync_core::logger::init_logger(&config.log_dir(), "lumensync", settings.log_retention_count, stream_logs)?;

    log_info!("LumenSync started: {:?}", command);
    if let Some(log_path) = lumensync_core::logger::get_log_path() {
        log_info!("Log file: {}", log_path.display());
    }
    if stream_logs {
        log_info!("Streaming mode enabled via --stream-logs");
    } else {
        log_info!("Buffered mode - logs will be written to file on exit");
    }

    let service = commands::Service::open(&config, settings)?;
    let result = match command {
        Command::List => commands::list(&service),
        Command::Refresh => commands::refresh(&service),
        Command::Set { target, value, feature } => commands::set(&service, &target, value, feature),
        Command::Average { ids } => commands::average(&service, &ids),
        Command::DebugExport { path } => {
            let path = path.unwrap_or_else(|| commands::default_report_path(&config));
            commands::debug_export(&service, &path)
        }
        Command::Watch => commands::watch(&service),
        Command::Help => Ok(()),
    };
    service.close();

    log_info!("=== LumenSync exiting ===");
    result
}
