use crate::args::{CommonArgs, DumpNameArg, JsonOutputArg, SelectionArgs};
use anyhow::Context;
use serde::Serialize;
use std::{
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
};
use tokio_util::sync::CancellationToken;
use wp_dumps::{
    dump::{
        self,
        engine::{self, DownloadEngine, DownloadTask, RunSummary},
        select,
    },
    http,
    progress::{self, BarObserver, EventSink, LogObserver, ProgressObserver},
    util::fmt::{Bytes, Sha1Hash},
    Result,
};

/// Exit status when the run was cancelled with Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Download the files of a dump version, resuming partial files and skipping files
/// already downloaded.
#[derive(clap::Args, Clone, Debug)]
pub struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    dump_name: DumpNameArg,

    #[clap(flatten)]
    selection: SelectionArgs,

    /// The base URL of the server to download files from, e.g.
    /// `https://mirror.accum.se/mirror/wikimedia.org/dumps`.
    ///
    /// If not present tries to read the environment variable `WPD_MIRROR_URL`, finally
    /// uses the Wikimedia dumps server. Using a mirror is usually much faster.
    ///
    /// Mirrors are listed here: <https://dumps.wikimedia.org/mirrors.html>
    #[arg(long, env = "WPD_MIRROR_URL", default_value = dump::DUMPS_WIKIMEDIA_SERVER)]
    mirror_url: String,

    /// Maximum number of files to download at once.
    #[arg(long, env = "WPD_MAX_CONCURRENCY", default_value_t = 4,
          value_parser = clap::value_parser!(u16).range(1..))]
    max_concurrency: u16,

    /// Maximum network attempts per file when transient errors occur, e.g. connection
    /// resets, timeouts or HTTP 503 responses.
    #[arg(long, env = "WPD_MAX_RETRIES", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: u32,

    /// Print the files that would be downloaded and where they would be saved, then exit
    /// without downloading anything.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Don't show progress bars. Bars are only shown when stderr is a terminal and logs
    /// are not JSON.
    #[arg(long, default_value_t = false)]
    no_progress: bool,

    #[clap(flatten)]
    json: JsonOutputArg,
}

#[derive(Serialize)]
struct PlannedFile<'a> {
    name: &'a str,
    url: &'a str,
    destination: &'a PathBuf,
    size: Option<Bytes>,
    sha1: Option<Sha1Hash>,
}

#[tracing::instrument(level = "trace")]
pub async fn main(args: Args) -> Result<ExitCode> {
    let dump_name = &args.dump_name.value;

    let fetcher = args.common.manifest_fetcher(Some(args.selection.versions_limit))?;
    let manifest = fetcher.fetch(dump_name, &args.selection.version.value).await?;
    let selected = select::select(&manifest, &args.selection.selection())?;

    if !selected.complete {
        tracing::warn!(dump = %dump_name,
                       version = %selected.version,
                       "Downloading from a dump version that is not complete");
    }
    if selected.pending_files > 0 {
        tracing::warn!(pending_files = selected.pending_files,
                       "Some selected jobs list files that are not available yet; \
                        they will not be downloaded");
    }

    let out_dir = args.common.dumps_path();
    let tasks = select::plan_tasks(&selected, &*args.mirror_url, &*out_dir);

    tracing::info!(dump = %dump_name,
                   version = %selected.version,
                   files_count = tasks.len(),
                   total_size = %Bytes(tasks.iter()
                                           .filter_map(|t| t.entry.size)
                                           .map(|s| s.0)
                                           .sum()),
                   out_dir = %out_dir.display(),
                   "Planned downloads");

    if args.dry_run {
        print_plan(&tasks, args.json.value)?;
        return Ok(ExitCode::SUCCESS);
    }

    let (sink, rx) = EventSink::channel(progress::DEFAULT_CHANNEL_CAPACITY);
    let show_bars = !args.no_progress
                    && !args.common.log_json
                    && std::io::stderr().is_terminal();
    let observer: Box<dyn ProgressObserver> =
        if show_bars {
            Box::new(BarObserver::new(tasks.len() as u64))
        } else {
            Box::new(LogObserver)
        };
    let reporter = progress::spawn_reporter(rx, observer);

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Received Ctrl-C, stopping downloads. \
                                Partial files are kept and resumed on the next run.");
                cancel.cancel();
            }
        }
    });

    let engine_options = engine::OptionsBuilder::default()
                             .max_concurrency(usize::from(args.max_concurrency))
                             .max_retries(args.max_retries)
                             .events(sink)
                             .cancel(cancel.clone())
                             .build()?;
    let client = http::download_client(&args.common.http_options()?)?;
    let engine = DownloadEngine::new(client, engine_options);

    let summary = engine.run(tasks).await?;

    ctrl_c.abort();
    // Dropping the engine drops the last event sender, which ends the reporter.
    drop(engine);
    reporter.await.context("while waiting for the progress reporter")?;

    if args.json.value {
        serde_json::to_writer_pretty(&std::io::stdout(), &summary)?;
        println!();
    } else {
        print_summary(&summary);
    }

    Ok(if summary.counts.cancelled > 0 || cancel.is_cancelled() {
        ExitCode::from(EXIT_CANCELLED)
    } else if summary.counts.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_plan(tasks: &[DownloadTask], json: bool) -> Result<()> {
    if json {
        let planned = tasks.iter()
                           .map(|task| PlannedFile {
                               name: &*task.entry.name,
                               url: &*task.url,
                               destination: &task.destination,
                               size: task.entry.size,
                               sha1: task.entry.sha1,
                           })
                           .collect::<Vec<_>>();
        serde_json::to_writer_pretty(&std::io::stdout(), &planned)?;
        println!();
    } else {
        for task in tasks.iter() {
            println!("{url} -> {dest} ({size})",
                     url = task.url,
                     dest = task.destination.display(),
                     size = task.entry.size.map(|s| s.to_string())
                                           .unwrap_or_else(|| "size unknown".to_string()));
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let counts = &summary.counts;
    println!("completed: {completed}, skipped: {skipped}, failed: {failed}, \
              cancelled: {cancelled}",
             completed = counts.completed,
             skipped = counts.skipped,
             failed = counts.failed,
             cancelled = counts.cancelled);
    println!("downloaded: {stats}", stats = summary.stats);

    for (task, reason) in summary.failures() {
        println!("FAILED {name}: {reason}", name = task.file_name);
    }
}
