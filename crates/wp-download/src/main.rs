mod args;
mod commands;

use clap::Parser;
use std::process::ExitCode;
use tracing::Level;
use wp_dumps::{
    dump::{manifest::ManifestError, select::SelectError},
    Result,
};

#[derive(clap::Parser, Clone, Debug)]
#[command(about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Set this flag to enable logging to stderr as JSON. Logs are in a text format by default.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(clap::Subcommand, Clone, Debug)]
enum Command {
    Completion(commands::completion::Args),
    Download(commands::download::Args),
    GetDumps(commands::get_dumps::Args),
    GetFileInfo(commands::get_file_info::Args),
    GetJob(commands::get_job::Args),
    GetVersions(commands::get_versions::Args),
}

#[derive(Eq, PartialEq)]
enum LogMode {
    Pretty,
    Json,
}

/// Exit status when the dump metadata couldn't be fetched or parsed.
const EXIT_MANIFEST: u8 = 2;

/// Exit status when no usable files were selected.
const EXIT_SELECTION: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(args.log_json) {
        eprintln!("Error initialising logging: {e:?}");
        return ExitCode::FAILURE;
    }

    if tracing::enabled!(Level::DEBUG) {
        tracing::debug!(args = ?args.clone(), "parsed CLI args");
    }

    let res = match args.command {
        Command::Completion(cmd_args) => commands::completion::main(cmd_args).await,
        Command::Download(cmd_args) => commands::download::main(cmd_args).await,
        Command::GetDumps(cmd_args) => commands::get_dumps::main(cmd_args).await,
        Command::GetFileInfo(cmd_args) => commands::get_file_info::main(cmd_args).await,
        Command::GetJob(cmd_args) => commands::get_job::main(cmd_args).await,
        Command::GetVersions(cmd_args) => commands::get_versions::main(cmd_args).await,
    };

    match res {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::from(exit_status(&e))
        },
    }
}

fn exit_status(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<ManifestError>().is_some() {
        EXIT_MANIFEST
    } else if e.downcast_ref::<SelectError>().is_some() {
        EXIT_SELECTION
    } else {
        1
    }
}

fn init_logging(log_json: bool) -> Result<()> {
    use tracing_bunyan_formatter::{
        BunyanFormattingLayer,
        JsonStorageLayer,
    };
    use tracing_subscriber::{
        EnvFilter,
        filter::LevelFilter,
        fmt,
        prelude::*,
    };

    let log_mode = if log_json { LogMode::Json } else { LogMode::Pretty };

    tracing_subscriber::Registry::default()
        .with(if log_mode == LogMode::Pretty {
                  Some(fmt::Layer::new()
                           .event_format(fmt::format()
                                             .compact()
                                             .with_timer(fmt::time::UtcTime::<_>::
                                                             rfc_3339())
                                             .with_target(true)
                                             .with_thread_ids(true))
                           .with_writer(std::io::stderr))
              } else {
                  None
              })
        .with(if log_mode == LogMode::Json {
                  Some(JsonStorageLayer
                           .and_then(BunyanFormattingLayer::new(
                               env!("CARGO_CRATE_NAME").to_string(),
                               std::io::stderr)))
              } else {
                  None
              })
        // Global filter
        .with(EnvFilter::builder()
                  .with_default_directive(LevelFilter::INFO.into())
                  .parse(std::env::var("RUST_LOG")
                             .unwrap_or(format!("warn,{crate_}=info,wp_dumps=info",
                                                crate_ = env!("CARGO_CRATE_NAME"))))?)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn exit_status_by_error_type() {
        let manifest = anyhow::Error::new(ManifestError::Parse {
            url: "https://dumps.wikimedia.org/enwiki/".to_string(),
            message: "no links".to_string(),
        }).context("while fetching the manifest");
        assert_eq!(exit_status(&manifest), EXIT_MANIFEST);

        let other = anyhow::format_err!("disk full");
        assert_eq!(exit_status(&other), 1);
    }

    #[test]
    fn parse_download_args() {
        let args = Args::try_parse_from([
            "wp-download", "download",
            "--dump", "enwiki",
            "--version", "20230301",
            "--job", "abstractsdump",
            "--file-pattern", "*-abstract*.xml.gz",
            "--max-concurrency", "2",
            "--dry-run",
        ]).unwrap();
        assert!(matches!(args.command, Command::Download(_)));
    }
}
