//! CLI entrypoint for the rtpthread scenario harness.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use rtpthread_core::RuntimeConfig;
use rtpthread_harness::{SCENARIOS, SuiteReport, lock_timeout_ms};

/// Behavioral checks for rtpthread.
#[derive(Debug, Parser)]
#[command(name = "rtpthread-harness")]
#[command(about = "Run behavioral scenarios against the rtpthread layer")]
struct Cli {
    /// Log level written to stderr (off, error, warn, info, debug, trace).
    /// `RUST_LOG` overrides it.
    #[arg(long, global = true, default_value = "warn")]
    log_level: LevelFilter,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every scenario.
    List,
    /// Run scenarios and print a JSON report.
    Run {
        /// Run only this scenario (repeatable).
        #[arg(long)]
        scenario: Vec<String>,
        /// Write the report here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Diagnostic lock timeout in milliseconds; 0 waits forever.
        /// Defaults to `RTPTHREAD_LOCK_TIMEOUT_MS` or the built-in bound.
        #[arg(long)]
        lock_timeout_ms: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .try_init()?;

    match cli.command {
        Command::List => {
            for scenario in SCENARIOS {
                println!("{:<22} {}", scenario.name, scenario.about);
            }
        }
        Command::Run {
            scenario,
            output,
            lock_timeout_ms: timeout,
        } => {
            let mut config = RuntimeConfig::from_env();
            if let Some(ms) = timeout {
                config.lock_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }

            let suite = if scenario.is_empty() {
                rtpthread_harness::run_all(&config)
            } else {
                let mut reports = Vec::with_capacity(scenario.len());
                for name in &scenario {
                    let report = rtpthread_harness::run_named(name, &config)
                        .ok_or_else(|| format!("unknown scenario: {name}"))?;
                    reports.push(report);
                }
                SuiteReport::new(lock_timeout_ms(&config), reports)
            };

            let json = serde_json::to_string_pretty(&suite)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Report written to {}", path.display());
                }
                None => println!("{json}"),
            }
            eprintln!("{} passed, {} failed", suite.passed, suite.failed);
            if !suite.all_passed() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_feeds_the_logger_filter() {
        let cli = Cli::try_parse_from(["harness", "--log-level", "debug", "list"]).unwrap();
        assert_eq!(cli.log_level, LevelFilter::Debug);
        assert!(matches!(cli.command, Command::List));

        let cli = Cli::try_parse_from(["harness", "run", "--scenario", "cancel"]).unwrap();
        assert_eq!(cli.log_level, LevelFilter::Warn);
        assert!(Cli::try_parse_from(["harness", "--log-level", "loud", "list"]).is_err());
    }
}
