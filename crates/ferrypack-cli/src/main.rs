#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::Parser;
use ferrypack_core::Config;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ferrypack")]
#[command(author, version, about = "A loader-driven module bundler", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Project config file (default: ferrypack.json in the working directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Build the bundle once and write it to the output directory
    Build {
        /// Override the configured entry module
        #[arg(long)]
        entry: Option<String>,

        /// Fail on modules no loader rule matches instead of passing them through
        #[arg(long)]
        strict_loaders: bool,
    },

    /// Serve the bundle and rebuild it when sources change
    Dev {
        /// Override the configured entry module
        #[arg(long)]
        entry: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Fail on modules no loader rule matches instead of passing them through
        #[arg(long)]
        strict_loaders: bool,
    },

    /// Run the companion compiler server on stdin/stdout
    #[command(hide = true)]
    Companion,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine working directory
    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::new(cwd.clone())
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json);

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(config.json_logs),
        Some(Commands::Build {
            entry,
            strict_loaders,
        }) => {
            let span = tracing::info_span!("build", cmd = "build", cwd = %cwd.display());
            let _guard = span.enter();
            let action = commands::build::BuildAction {
                project: commands::ProjectArgs {
                    cwd,
                    config: cli.config,
                    entry,
                },
                strict_loaders,
            };
            commands::build::run(&config, action)
        }
        Some(Commands::Dev {
            entry,
            port,
            host,
            strict_loaders,
        }) => {
            let span = tracing::info_span!("dev", cmd = "dev", cwd = %cwd.display());
            let _guard = span.enter();
            let action = commands::dev::DevAction {
                project: commands::ProjectArgs {
                    cwd,
                    config: cli.config,
                    entry,
                },
                port,
                host,
                strict_loaders,
            };
            commands::dev::run(action)
        }
        Some(Commands::Companion) => commands::companion::run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ferrypack",
            "dev",
            "--port",
            "4010",
            "--config",
            "site/ferrypack.json",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("site/ferrypack.json")));
        match cli.command {
            Some(Commands::Dev { port, host, .. }) => {
                assert_eq!(port, Some(4010));
                assert_eq!(host, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_build_flags() {
        let cli = Cli::try_parse_from([
            "ferrypack",
            "build",
            "--entry",
            "./src/other",
            "--strict-loaders",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Build { entry: Some(ref e), strict_loaders: true }) if e == "./src/other"
        ));
    }
}
