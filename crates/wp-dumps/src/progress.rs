//! Progress events from the download engine, and observers that render them.
//!
//! The engine pushes [`ProgressEvent`]s into an [`EventSink`] without ever waiting: when the
//! channel is full the event is dropped and counted. A reporter task drains the channel
//! and hands each event to a [`ProgressObserver`].

use crate::util::fmt::Bytes;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgressEvent {
    pub task_id: usize,
    pub file_name: Arc<str>,
    pub kind: EventKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    TaskStarted {
        /// Declared size of the file, if known.
        total: Option<u64>,

        /// Bytes already on disk from an earlier run.
        resume_from: u64,
    },
    TaskProgress {
        bytes_so_far: u64,
    },
    TaskCompleted {
        len: u64,
    },
    TaskFailed {
        reason: String,
    },
    TaskSkipped,
    TaskCancelled,
}

/// The sending half of the progress channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

impl EventSink {
    pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventSink { tx, dropped: Arc::new(AtomicU64::new(0)) }, rx)
    }

    /// Send an event without waiting. Drops it if the channel is full or closed.
    pub fn emit(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            },
            Err(TrySendError::Closed(_)) => (),
        }
    }

    /// Count of events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub trait ProgressObserver: Send + 'static {
    fn on_event(&mut self, event: &ProgressEvent);

    /// Called once the channel is closed and drained.
    fn finish(&mut self) {}
}

impl ProgressObserver for Box<dyn ProgressObserver> {
    fn on_event(&mut self, event: &ProgressEvent) {
        (**self).on_event(event)
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}

/// Drive `observer` with every event from `rx` until all senders are dropped.
///
/// Returns the observer when done.
pub fn spawn_reporter<O: ProgressObserver>(
    mut rx: mpsc::Receiver<ProgressEvent>,
    mut observer: O,
) -> JoinHandle<O> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            observer.on_event(&event);
        }
        observer.finish();
        observer
    })
}

/// Logs task lifecycle events with `tracing`. Per-chunk progress is only logged at trace level.
#[derive(Debug, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_event(&mut self, event: &ProgressEvent) {
        let file = &*event.file_name;
        let task_id = event.task_id;
        match &event.kind {
            EventKind::TaskStarted { total, resume_from } =>
                tracing::info!(task_id, file, total = ?total.map(Bytes), resume_from,
                               "Download started"),
            EventKind::TaskProgress { bytes_so_far } =>
                tracing::trace!(task_id, file, bytes_so_far, "Download progress"),
            EventKind::TaskCompleted { len } =>
                tracing::info!(task_id, file, len = %Bytes(*len), "Download completed"),
            EventKind::TaskFailed { reason } =>
                tracing::warn!(task_id, file, reason = reason.as_str(), "Download failed"),
            EventKind::TaskSkipped =>
                tracing::info!(task_id, file, "Existing file OK, skipped"),
            EventKind::TaskCancelled =>
                tracing::info!(task_id, file, "Download cancelled"),
        }
    }
}

const BAR_TEMPLATE: &str =
    "{prefix:>40.cyan.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} \
     {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const SPINNER_TEMPLATE: &str =
    "{spinner:.blue} {prefix:>38.cyan.bold} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}";
const BAR_CHARS: &str = "█▓▒░  ";

/// Renders one terminal progress bar per in-flight download, plus a bar counting
/// finished files.
pub struct BarObserver {
    multi: MultiProgress,
    overall: ProgressBar,
    bars: BTreeMap<usize, ProgressBar>,
}

impl BarObserver {
    pub fn new(task_count: u64) -> BarObserver {
        Self::with_draw_target(task_count, ProgressDrawTarget::stderr())
    }

    pub fn hidden(task_count: u64) -> BarObserver {
        Self::with_draw_target(task_count, ProgressDrawTarget::hidden())
    }

    fn with_draw_target(task_count: u64, target: ProgressDrawTarget) -> BarObserver {
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(task_count));
        if let Ok(style) = ProgressStyle::with_template(
            "{prefix:>40.green.bold} [{elapsed_precise}] {wide_bar} {pos}/{len} files {msg}")
        {
            overall.set_style(style);
        }
        overall.set_prefix("total");

        BarObserver {
            multi,
            overall,
            bars: BTreeMap::new(),
        }
    }

    /// Position of the bar for `task_id`, for tests.
    pub fn position(&self, task_id: usize) -> Option<u64> {
        self.bars.get(&task_id).map(|bar| bar.position())
    }

    pub fn finished_count(&self) -> u64 {
        self.overall.position()
    }

    fn new_bar(&self, file_name: &str, total: Option<u64>) -> ProgressBar {
        let (bar, template) = match total {
            Some(len) => (ProgressBar::new(len), BAR_TEMPLATE),
            None => (ProgressBar::new_spinner(), SPINNER_TEMPLATE),
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars(BAR_CHARS));
        }
        bar.set_prefix(file_name.to_string());
        self.multi.insert_before(&self.overall, bar)
    }

    fn end_bar(&mut self, task_id: usize, msg: &'static str, abandon: bool) {
        if let Some(bar) = self.bars.remove(&task_id) {
            if abandon {
                bar.abandon_with_message(msg);
            } else {
                bar.finish_with_message(msg);
            }
        }
        self.overall.inc(1);
    }
}

impl ProgressObserver for BarObserver {
    fn on_event(&mut self, event: &ProgressEvent) {
        match &event.kind {
            EventKind::TaskStarted { total, resume_from } => {
                let bar = self.new_bar(&*event.file_name, *total);
                bar.set_position(*resume_from);
                if *resume_from > 0 {
                    bar.set_message("resuming");
                }
                self.bars.insert(event.task_id, bar);
            },
            EventKind::TaskProgress { bytes_so_far } => {
                if let Some(bar) = self.bars.get(&event.task_id) {
                    bar.set_position(*bytes_so_far);
                }
            },
            EventKind::TaskCompleted { len } => {
                if let Some(bar) = self.bars.get(&event.task_id) {
                    bar.set_position(*len);
                }
                self.end_bar(event.task_id, "done", false);
            },
            EventKind::TaskFailed { .. } => self.end_bar(event.task_id, "FAILED", true),
            EventKind::TaskSkipped => self.end_bar(event.task_id, "skipped", false),
            EventKind::TaskCancelled => self.end_bar(event.task_id, "cancelled", true),
        }
    }

    fn finish(&mut self) {
        for (_, bar) in std::mem::take(&mut self.bars).into_iter() {
            bar.abandon();
        }
        self.overall.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(task_id: usize, kind: EventKind) -> ProgressEvent {
        ProgressEvent {
            task_id,
            file_name: Arc::from("enwiki-20230301-abstract.xml.gz"),
            kind,
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<ProgressEvent>, bool);

    impl ProgressObserver for Recorder {
        fn on_event(&mut self, event: &ProgressEvent) {
            self.0.push(event.clone());
        }

        fn finish(&mut self) {
            self.1 = true;
        }
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = EventSink::channel(2);
        for i in 0..5 {
            sink.emit(event(0, EventKind::TaskProgress { bytes_so_far: i }));
        }
        assert_eq!(sink.dropped(), 3);

        drop(sink);
        let mut received = vec![];
        while let Some(e) = rx.recv().await {
            received.push(e);
        }
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_is_harmless() {
        let (sink, rx) = EventSink::channel(2);
        drop(rx);
        sink.emit(event(0, EventKind::TaskSkipped));
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn reporter_delivers_in_order_and_finishes() {
        let (sink, rx) = EventSink::channel(16);
        let handle = spawn_reporter(rx, Recorder::default());

        sink.emit(event(1, EventKind::TaskStarted { total: Some(10), resume_from: 0 }));
        sink.emit(event(1, EventKind::TaskProgress { bytes_so_far: 5 }));
        sink.emit(event(1, EventKind::TaskCompleted { len: 10 }));
        drop(sink);

        let recorder = handle.await.unwrap();
        assert!(recorder.1);
        assert_eq!(recorder.0.iter().map(|e| e.kind.clone()).collect::<Vec<_>>(),
                   vec![EventKind::TaskStarted { total: Some(10), resume_from: 0 },
                        EventKind::TaskProgress { bytes_so_far: 5 },
                        EventKind::TaskCompleted { len: 10 }]);
    }

    #[test]
    fn bar_observer_tracks_tasks() {
        let mut bars = BarObserver::hidden(3);

        bars.on_event(&event(0, EventKind::TaskStarted { total: Some(100), resume_from: 40 }));
        assert_eq!(bars.position(0), Some(40));
        bars.on_event(&event(0, EventKind::TaskProgress { bytes_so_far: 70 }));
        assert_eq!(bars.position(0), Some(70));
        bars.on_event(&event(0, EventKind::TaskCompleted { len: 100 }));
        assert_eq!(bars.position(0), None);

        bars.on_event(&event(1, EventKind::TaskSkipped));
        bars.on_event(&event(2, EventKind::TaskStarted { total: None, resume_from: 0 }));
        bars.on_event(&event(2, EventKind::TaskFailed { reason: "HTTP 404".to_string() }));
        assert_eq!(bars.finished_count(), 3);

        bars.finish();
    }
}
