//! Download a planned set of dump files with a bounded pool of workers.
//!
//! Each [`DownloadTask`] moves through [`TransferState`]s: an existing file that already
//! verifies is skipped, a partial file is resumed with an HTTP range request, and a finished
//! file is checked against the manifest size and SHA1 hash. Transient network failures are
//! retried with exponential backoff. One task failing never stops the others.

mod retry;

pub use retry::{FailureClass, RetryDecision, RetryPolicy, RetryState};

use crate::{
    dump::{
        FileEntry,
        local,
        verify::{self, Expected, Verified, VerifyError},
    },
    http::{FileClient, FileResponse, TransferError},
    progress::{EventKind, EventSink, ProgressEvent},
    util::fmt::{self, Bytes, TransferStats},
};
use derive_builder::Builder;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    result::Result as StdResult,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Builder, Clone, Debug)]
pub struct Options {
    /// Maximum number of files transferred at once.
    #[builder(default = "4")]
    max_concurrency: usize,

    /// Maximum network attempts per file that end in a transient failure.
    #[builder(default = "5")]
    max_retries: u32,

    #[builder(default = "Duration::from_secs(1)")]
    backoff_base: Duration,

    #[builder(default = "Duration::from_secs(60)")]
    backoff_cap: Duration,

    /// Maximum wait for response headers or for the next chunk of a response body.
    #[builder(default = "Duration::from_secs(60)")]
    chunk_timeout: Duration,

    #[builder(default, setter(strip_option))]
    events: Option<EventSink>,

    /// Cancel this to stop the run: queued tasks are not started and in-flight transfers
    /// stop after the chunk they are writing.
    #[builder(default)]
    cancel: CancellationToken,
}

/// One file to fetch from `url` and save at `destination`.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    pub id: usize,
    pub entry: FileEntry,
    pub url: String,
    pub destination: PathBuf,

    /// Bytes of the file currently on disk.
    pub bytes_present: u64,
    pub state: TransferState,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    InProgress,
    Verifying,
    Completed,
    Failed(FailureReason),
    Skipped,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection errors, timeouts and interrupted bodies, after all retries.
    Network,

    /// An HTTP error status code.
    HttpStatus,

    /// The server can't resume a partial file, even after one restart from zero.
    ResumeUnsupported,

    /// Size or SHA1 mismatch, even after one fresh download.
    Integrity,

    /// The file's relative URL in the manifest is not a safe path.
    MalformedPath,

    /// Reading or writing local files.
    LocalIo,
}

/// How a task ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Skipped,
    Failed(FailureReason),

    /// The run was cancelled before this task finished. Any partial file is kept.
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskReport {
    pub id: usize,
    pub file_name: String,
    pub url: String,
    pub destination: PathBuf,
    #[serde(flatten)]
    pub outcome: TaskOutcome,

    /// Network requests made for this task.
    pub attempts: u32,

    /// Bytes received over the network for this task in this run.
    pub stats: TransferStats,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SummaryCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub counts: SummaryCounts,

    /// One report per task, in the order the tasks were given.
    pub tasks: Vec<TaskReport>,

    /// All bytes received over the network during the run.
    pub stats: TransferStats,

    /// Most tasks that were in progress at the same time.
    pub max_in_progress: usize,

    /// Progress events dropped because the reporter fell behind.
    pub events_dropped: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Two download tasks have the same destination \
             path='{path_display}' first_task={first} second_task={second}",
            path_display = .path.display())]
    DuplicateTask {
        path: PathBuf,
        first: usize,
        second: usize,
    },

    #[error("A download worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Why a single network attempt stopped.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("partial file can't be resumed: {0}")]
    ResumeMismatch(String),

    #[error("server does not support resuming downloads: {0}")]
    ResumeUnsupported(String),

    #[error("{0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

/// Where to start writing a response body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WriteMode {
    /// Append to the partial file at this offset.
    Append(u64),

    /// Truncate the file and write from zero.
    Truncate,

    /// The server says there is nothing after the partial file.
    AlreadyComplete,
}

enum ExistingFile {
    /// No usable bytes on disk.
    None,
    Partial,
    Complete,

    /// The run was cancelled while the file was being checked.
    Interrupted,
}

pub struct DownloadEngine<C: FileClient> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    client: C,
    options: Options,
}

/// Shared between the workers of one run.
struct RunState {
    queue: Mutex<VecDeque<DownloadTask>>,
    in_progress: AtomicUsize,
    max_in_progress: AtomicUsize,
}

/// Counts a task as in progress while alive.
struct InProgressGuard<'a>(&'a RunState);

impl DownloadTask {
    pub fn new(id: usize, entry: FileEntry, url: String, destination: PathBuf) -> DownloadTask {
        DownloadTask {
            id,
            entry,
            url,
            destination,
            bytes_present: 0,
            state: TransferState::Pending,
        }
    }

    fn expected(&self) -> Expected {
        Expected::new(self.entry.size, self.entry.sha1)
    }
}

impl FailureReason {
    fn new(kind: FailureKind, message: impl Into<String>) -> FailureReason {
        FailureReason { kind, message: message.into() }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{kind:?}: {message}", kind = self.kind, message = self.message)
    }
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.counts.failed == 0 && self.counts.cancelled == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TaskReport, &FailureReason)> {
        self.tasks.iter().filter_map(|task| match &task.outcome {
            TaskOutcome::Failed(reason) => Some((task, reason)),
            _ => None,
        })
    }
}

impl AttemptError {
    fn class(&self) -> FailureClass {
        match self {
            AttemptError::Transfer(e) if e.is_transient() => FailureClass::Transient,
            AttemptError::ResumeMismatch(_) => FailureClass::ResumeMismatch,
            AttemptError::Transfer(_)
                | AttemptError::ResumeUnsupported(_)
                | AttemptError::Io(_)
                | AttemptError::Cancelled => FailureClass::Permanent,
        }
    }

    /// The outcome of a task that ends with this error.
    fn into_outcome(self, attempts: u32) -> TaskOutcome {
        let reason = match self {
            AttemptError::Cancelled => return TaskOutcome::Cancelled,
            AttemptError::Transfer(e @ TransferError::Status(_)) =>
                FailureReason::new(FailureKind::HttpStatus, e.to_string()),
            AttemptError::Transfer(e) if e.is_transient() =>
                FailureReason::new(FailureKind::Network,
                                   format!("{e} (after {attempts} attempts)")),
            AttemptError::Transfer(e) => FailureReason::new(FailureKind::Network, e.to_string()),
            AttemptError::ResumeMismatch(msg) | AttemptError::ResumeUnsupported(msg) =>
                FailureReason::new(FailureKind::ResumeUnsupported, msg),
            AttemptError::Io(msg) => FailureReason::new(FailureKind::LocalIo, msg),
        };
        TaskOutcome::Failed(reason)
    }
}

fn io_error(context: &str, path: &Path) -> impl Fn(std::io::Error) -> AttemptError {
    let message = format!("{context} path='{path}'", path = path.display());
    move |e| AttemptError::Io(format!("{message}: {e}"))
}

impl RunState {
    fn enter_in_progress(&self) -> InProgressGuard<'_> {
        let now = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_progress.fetch_max(now, Ordering::SeqCst);
        InProgressGuard(self)
    }

    fn next_task(&self) -> Option<DownloadTask> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.in_progress.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reject task lists where two tasks would write the same file.
pub fn check_unique_destinations(tasks: &[DownloadTask]) -> StdResult<(), EngineError> {
    let mut seen = HashMap::<&Path, usize>::with_capacity(tasks.len());
    for task in tasks.iter() {
        if let Some(first) = seen.insert(&*task.destination, task.id) {
            return Err(EngineError::DuplicateTask {
                path: task.destination.clone(),
                first,
                second: task.id,
            });
        }
    }
    Ok(())
}

impl<C: FileClient> DownloadEngine<C> {
    pub fn new(client: C, options: Options) -> DownloadEngine<C> {
        DownloadEngine {
            inner: Arc::new(Inner { client, options }),
        }
    }

    /// Run every task to a terminal state and summarise the results.
    ///
    /// Only returns an error before any transfer starts (e.g. duplicate destinations) or
    /// if a worker panics; individual file failures are reported in the summary.
    pub async fn run(&self, tasks: Vec<DownloadTask>) -> StdResult<RunSummary, EngineError> {
        let start = Instant::now();
        check_unique_destinations(&tasks)?;

        let task_count = tasks.len();
        let worker_count = self.inner.options.max_concurrency.max(1).min(task_count);

        tracing::info!(task_count,
                       worker_count,
                       max_retries = self.inner.options.max_retries,
                       "Download run starting");

        let run = Arc::new(RunState {
            queue: Mutex::new(tasks.into_iter().collect()),
            in_progress: AtomicUsize::new(0),
            max_in_progress: AtomicUsize::new(0),
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let inner = self.inner.clone();
            let run = run.clone();
            workers.spawn(async move {
                inner.worker(&run)
                     .instrument(tracing::debug_span!("download_worker", worker_id))
                     .await
            });
        }

        let mut reports = Vec::with_capacity(task_count);
        while let Some(res) = workers.join_next().await {
            let worker_reports = res.map_err(|e| EngineError::WorkerPanicked(e.to_string()))?;
            reports.extend(worker_reports);
        }

        // Tasks never started because the run was cancelled.
        let never_started = std::mem::take(
            &mut *run.queue.lock().unwrap_or_else(PoisonError::into_inner));
        for task in never_started.into_iter() {
            self.inner.emit(&task, EventKind::TaskCancelled);
            reports.push(TaskReport::new(&task, TaskOutcome::Cancelled, 0,
                                         TransferStats::new(Bytes(0), Duration::ZERO)));
        }

        reports.sort_by_key(|report| report.id);

        let mut counts = SummaryCounts::default();
        let mut network_len = 0_u64;
        for report in reports.iter() {
            network_len += report.stats.len.0;
            match report.outcome {
                TaskOutcome::Completed => counts.completed += 1,
                TaskOutcome::Skipped => counts.skipped += 1,
                TaskOutcome::Failed(_) => counts.failed += 1,
                TaskOutcome::Cancelled => counts.cancelled += 1,
            }
        }

        let summary = RunSummary {
            counts,
            tasks: reports,
            stats: TransferStats::new(Bytes(network_len), start.elapsed()),
            max_in_progress: run.max_in_progress.load(Ordering::SeqCst),
            events_dropped: self.inner.options.events.as_ref()
                                .map(|sink| sink.dropped())
                                .unwrap_or(0),
        };

        tracing::info!(completed = counts.completed,
                       failed = counts.failed,
                       skipped = counts.skipped,
                       cancelled = counts.cancelled,
                       stats = %summary.stats,
                       "Download run complete");

        Ok(summary)
    }
}

impl TaskReport {
    fn new(
        task: &DownloadTask,
        outcome: TaskOutcome,
        attempts: u32,
        stats: TransferStats,
    ) -> TaskReport {
        TaskReport {
            id: task.id,
            file_name: task.entry.name.clone(),
            url: task.url.clone(),
            destination: task.destination.clone(),
            outcome,
            attempts,
            stats,
        }
    }
}

impl<C: FileClient> Inner<C> {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.options.max_retries,
            backoff_base: self.options.backoff_base,
            backoff_cap: self.options.backoff_cap,
        }
    }

    fn emit(&self, task: &DownloadTask, kind: EventKind) {
        if let Some(sink) = self.options.events.as_ref() {
            sink.emit(ProgressEvent {
                task_id: task.id,
                file_name: Arc::from(task.entry.name.as_str()),
                kind,
            });
        }
    }

    async fn worker(&self, run: &RunState) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        loop {
            if self.options.cancel.is_cancelled() {
                break;
            }
            let Some(task) = run.next_task() else {
                break;
            };

            let span = tracing::info_span!("download_task",
                                           task_id = task.id,
                                           file = task.entry.name.as_str());
            reports.push(self.process(run, task).instrument(span).await);
        }
        reports
    }

    async fn process(&self, run: &RunState, mut task: DownloadTask) -> TaskReport {
        let start = Instant::now();
        let mut retry = RetryState::new(self.retry_policy());
        let mut transferred = 0_u64;

        let outcome = self.drive(run, &mut task, &mut retry, &mut transferred).await;
        let stats = TransferStats::new(Bytes(transferred), start.elapsed());

        match &outcome {
            TaskOutcome::Completed => {
                task.state = TransferState::Completed;
                tracing::info!(url = task.url.as_str(),
                               path = %task.destination.display(),
                               attempts = retry.attempts(),
                               %stats,
                               "Download complete");
                self.emit(&task, EventKind::TaskCompleted { len: task.bytes_present });
            },
            TaskOutcome::Skipped => {
                task.state = TransferState::Skipped;
                tracing::info!(path = %task.destination.display(),
                               "Existing file OK, skipping download");
                self.emit(&task, EventKind::TaskSkipped);
            },
            TaskOutcome::Failed(reason) => {
                task.state = TransferState::Failed(reason.clone());
                tracing::warn!(url = task.url.as_str(),
                               path = %task.destination.display(),
                               attempts = retry.attempts(),
                               %reason,
                               "Download failed");
                self.emit(&task, EventKind::TaskFailed { reason: reason.to_string() });
            },
            TaskOutcome::Cancelled => {
                tracing::info!(path = %task.destination.display(),
                               bytes_present = task.bytes_present,
                               "Download cancelled, partial file kept");
                self.emit(&task, EventKind::TaskCancelled);
            },
        }

        TaskReport::new(&task, outcome, retry.attempts(), stats)
    }

    async fn drive(
        &self,
        run: &RunState,
        task: &mut DownloadTask,
        retry: &mut RetryState,
        transferred: &mut u64,
    ) -> TaskOutcome {
        if let Err(e) = local::validate_file_relative_url(&*task.entry.path) {
            return TaskOutcome::Failed(
                FailureReason::new(FailureKind::MalformedPath, format!("{e:#}")));
        }

        match self.check_existing(task).await {
            Ok(ExistingFile::Complete) => return TaskOutcome::Skipped,
            Ok(ExistingFile::Interrupted) => return TaskOutcome::Cancelled,
            Ok(ExistingFile::None | ExistingFile::Partial) => (),
            Err(e) => return TaskOutcome::Failed(
                FailureReason::new(FailureKind::LocalIo, format!("{e:#}"))),
        }

        let _in_progress = run.enter_in_progress();
        task.state = TransferState::InProgress;
        self.emit(task, EventKind::TaskStarted {
            total: task.entry.size.map(|size| size.0),
            resume_from: task.bytes_present,
        });

        loop {
            if self.options.cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }

            task.state = TransferState::InProgress;

            let (class, outcome) = match self.attempt(task, retry, transferred).await {
                Ok(()) => {
                    task.state = TransferState::Verifying;
                    let Some(verified) = self.verify_unless_cancelled(task).await else {
                        return TaskOutcome::Cancelled;
                    };
                    match verified {
                        Ok(verified) => {
                            task.bytes_present = verified.len.0;
                            return TaskOutcome::Completed;
                        },
                        Err(VerifyError::Integrity(e)) => {
                            tracing::warn!(path = %task.destination.display(),
                                           error = %e,
                                           "Downloaded file failed verification, deleting it");
                            if let Err(e) = self.discard(task).await {
                                return e.into_outcome(retry.attempts());
                            }
                            (FailureClass::Integrity,
                             TaskOutcome::Failed(
                                 FailureReason::new(FailureKind::Integrity, e.to_string())))
                        },
                        Err(e @ VerifyError::Io { .. }) => return TaskOutcome::Failed(
                            FailureReason::new(FailureKind::LocalIo,
                                               format!("{:#}", anyhow::Error::new(e)))),
                    }
                },
                Err(e) => {
                    let class = e.class();
                    tracing::debug!(error = %e, ?class, attempt = retry.attempts(),
                                    "Download attempt failed");
                    (class, e.into_outcome(retry.attempts()))
                },
            };
            let reason = match outcome {
                TaskOutcome::Failed(reason) => reason,
                other => return other,
            };

            let delay = match retry.on_failure(class) {
                RetryDecision::GiveUp => return TaskOutcome::Failed(reason),
                RetryDecision::RetryAfter(delay) => delay,
            };

            if class == FailureClass::ResumeMismatch {
                tracing::warn!(path = %task.destination.display(),
                               reason = %reason,
                               "Discarding partial file and restarting from zero");
                if let Err(e) = self.discard(task).await {
                    return e.into_outcome(retry.attempts());
                }
            }

            if !delay.is_zero() {
                tracing::info!(delay = %fmt::Duration(delay),
                               reason = %reason,
                               attempt = retry.attempts(),
                               "Retrying download after a delay");
                tokio::select! {
                    _ = self.options.cancel.cancelled() => return TaskOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => (),
                }
            }
        }
    }

    /// Look at what is already at the task's destination, deleting a full-length file
    /// that fails verification.
    async fn check_existing(&self, task: &mut DownloadTask) -> crate::Result<ExistingFile> {
        let Some(len) = local::existing_len(&*task.destination).await? else {
            task.bytes_present = 0;
            return Ok(ExistingFile::None);
        };
        task.bytes_present = len;

        let full_length = match task.entry.size {
            Some(size) => len == size.0,
            None => task.entry.sha1.is_some(),
        };
        if !full_length {
            tracing::debug!(path = %task.destination.display(),
                            len,
                            "Found a partial file");
            return Ok(ExistingFile::Partial);
        }

        let Some(verified) = self.verify_unless_cancelled(task).await else {
            return Ok(ExistingFile::Interrupted);
        };
        match verified {
            Ok(_) => Ok(ExistingFile::Complete),
            Err(VerifyError::Integrity(e)) if task.entry.size.is_none() => {
                // With no declared size this may just be a partial file.
                tracing::debug!(path = %task.destination.display(),
                                error = %e,
                                "Existing file did not verify, will try to resume it");
                Ok(ExistingFile::Partial)
            },
            Err(VerifyError::Integrity(e)) => {
                tracing::warn!(path = %task.destination.display(),
                               error = %e,
                               "Existing file failed verification, deleting it");
                self.discard(task).await.map_err(anyhow::Error::new)?;
                Ok(ExistingFile::None)
            },
            Err(e @ VerifyError::Io { .. }) => Err(e.into()),
        }
    }

    /// Hash the destination file, giving up if the run is cancelled first.
    async fn verify_unless_cancelled(
        &self,
        task: &DownloadTask,
    ) -> Option<StdResult<Verified, VerifyError>> {
        let expected = task.expected();
        tokio::select! {
            biased;
            _ = self.options.cancel.cancelled() => None,
            res = verify::verify(&*task.destination, &expected) => Some(res),
        }
    }

    async fn discard(&self, task: &mut DownloadTask) -> StdResult<(), AttemptError> {
        match tokio::fs::remove_file(&*task.destination).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(io_error("while deleting a file", &*task.destination)(e)),
        }
        task.bytes_present = 0;
        Ok(())
    }

    /// Make one request and write its body to the destination.
    async fn attempt(
        &self,
        task: &mut DownloadTask,
        retry: &mut RetryState,
        transferred: &mut u64,
    ) -> StdResult<(), AttemptError> {
        let dest = task.destination.clone();
        let expected_len = task.entry.size.map(|size| size.0);

        let offset = local::existing_len(&*dest).await
                         .map_err(|e| AttemptError::Io(format!("{e:#}")))?
                         .unwrap_or(0);
        task.bytes_present = offset;

        if let Some(expected_len) = expected_len {
            if offset > expected_len {
                return Err(AttemptError::ResumeMismatch(format!(
                    "partial file is longer than the declared size \
                     file_len={offset} expected_len={expected_len}")));
            }
            if offset == expected_len && offset > 0 {
                tracing::debug!(path = %dest.display(), "File already has the declared length");
                return Ok(());
            }
        }

        retry.record_attempt();
        tracing::debug!(url = task.url.as_str(), offset, attempt = retry.attempts(),
                        "Requesting file");

        let response = tokio::select! {
            _ = self.options.cancel.cancelled() => return Err(AttemptError::Cancelled),
            res = tokio::time::timeout(self.options.chunk_timeout,
                                       self.client.get_file(&*task.url, offset)) =>
                res.map_err(|_| TransferError::Timeout(
                    "waiting for response headers".to_string()))??,
        };

        let mode = check_response(&response, offset, expected_len, retry)?;
        let start_at = match mode {
            WriteMode::AlreadyComplete => {
                tracing::debug!(path = %dest.display(),
                                "Server reports nothing after the partial file");
                return Ok(());
            },
            WriteMode::Append(offset) => offset,
            WriteMode::Truncate => {
                if offset > 0 {
                    tracing::warn!(url = task.url.as_str(),
                                   offset,
                                   "Server ignored the range request, \
                                    restarting download from zero");
                }
                0
            },
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await
                .map_err(io_error("while creating output directory", parent))?;
        }

        let mut open = OpenOptions::new();
        open.create(true);
        match mode {
            WriteMode::Append(_) => open.append(true),
            _ => open.write(true).truncate(true),
        };
        let mut file = open.open(&*dest).await
                           .map_err(io_error("while opening output file", &*dest))?;

        task.bytes_present = start_at;
        let body_res = self.write_body(task, &mut file, response.body, transferred).await;

        // Flush even after an error so the partial file's length matches what was received.
        let flush_res = async {
            file.flush().await?;
            file.sync_all().await
        }.await.map_err(io_error("while flushing output file", &*dest));

        body_res?;
        flush_res
    }

    async fn write_body(
        &self,
        task: &mut DownloadTask,
        file: &mut File,
        mut body: BoxStream<'static, StdResult<bytes::Bytes, TransferError>>,
        transferred: &mut u64,
    ) -> StdResult<(), AttemptError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.options.cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = tokio::time::timeout(self.options.chunk_timeout, body.next()) => next,
            };
            let next = next.map_err(|_| TransferError::Timeout(format!(
                "no data received for {timeout}",
                timeout = fmt::Duration(self.options.chunk_timeout))))?;

            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk?;

            file.write_all(&chunk).await
                .map_err(io_error("while writing output file", &*task.destination))?;

            let len = chunk.len() as u64;
            task.bytes_present += len;
            *transferred += len;
            self.emit(task, EventKind::TaskProgress { bytes_so_far: task.bytes_present });

            if self.options.cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
        }
    }
}

/// Decide how to write `response` given `offset` bytes already on disk.
fn check_response(
    response: &FileResponse,
    offset: u64,
    expected_len: Option<u64>,
    retry: &mut RetryState,
) -> StdResult<WriteMode, AttemptError> {
    let status = response.status;

    if offset == 0 {
        return match status.0 {
            reqwest::StatusCode::OK => Ok(WriteMode::Truncate),
            reqwest::StatusCode::PARTIAL_CONTENT
                if response.content_range.map(|range| range.start) == Some(0) =>
                Ok(WriteMode::Truncate),
            _ => Err(TransferError::Status(status).into()),
        };
    }

    match status.0 {
        reqwest::StatusCode::PARTIAL_CONTENT => {
            let Some(range) = response.content_range else {
                return Err(AttemptError::ResumeMismatch(
                    "206 response without a valid Content-Range header".to_string()));
            };
            if range.start != offset {
                return Err(AttemptError::ResumeMismatch(format!(
                    "Content-Range starts at the wrong offset \
                     range_start={start} file_len={offset}",
                    start = range.start)));
            }
            if let (Some(expected_len), Some(total)) = (expected_len, range.total) {
                if total != expected_len {
                    return Err(AttemptError::ResumeMismatch(format!(
                        "Content-Range total differs from the declared size \
                         range_total={total} expected_len={expected_len}")));
                }
            }
            if let (Some(expected_len), Some(len)) = (expected_len, response.content_length) {
                if offset + len != expected_len {
                    return Err(AttemptError::ResumeMismatch(format!(
                        "response length doesn't complete the file \
                         file_len={offset} content_length={len} expected_len={expected_len}")));
                }
            }
            Ok(WriteMode::Append(offset))
        },
        reqwest::StatusCode::OK => {
            if retry.take_restart() {
                Ok(WriteMode::Truncate)
            } else {
                Err(AttemptError::ResumeUnsupported(
                    "server ignored the range request again after a restart".to_string()))
            }
        },
        reqwest::StatusCode::RANGE_NOT_SATISFIABLE if expected_len.is_none() =>
            Ok(WriteMode::AlreadyComplete),
        reqwest::StatusCode::RANGE_NOT_SATISFIABLE =>
            Err(AttemptError::ResumeMismatch(format!(
                "server rejected the range request file_len={offset}"))),
        _ => Err(TransferError::Status(status).into()),
    }
}
