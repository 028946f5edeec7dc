//! Debounced reload scheduling.
//!
//! File-change notifications go through a [`ReloadManager`]. Each path gets
//! its own debounce deadline; a repeated notification inside the window
//! restarts it. Expired paths join a deduplicated queue, and the queue is
//! drained in batches by a [`ReloadHandler`].
//!
//! ```text
//! schedule_reload(p)
//!   → pending deadline per path (restarted on repeat)
//!   → queue (insertion order, deduplicated)
//!   → drain task: ReloadFile → handler.reload_file(p) → ReloadFailed?
//!   → ReloadBatchCompleted → handler.batch_completed
//! ```
//!
//! At most one drain runs at a time. Paths that expire mid-drain wait for
//! the next one. Disposing the manager stops its timers and drops the queue;
//! the file being rebuilt when that happens still completes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arbor_events::{EventBus, EventMetadata, RuntimeEvent};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RuntimeResult, panic_message};

/// Receives drained reload batches.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    /// Rebuild whatever `path` maps to. Errors are reported, never fatal.
    async fn reload_file(&self, path: &Path) -> RuntimeResult<()>;

    /// Called once after every drained batch with the processed paths.
    fn batch_completed(&self, _paths: &[PathBuf]) {}
}

/// Snapshot of a manager's queues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadStatus {
    /// Paths still inside their debounce window, soonest first.
    pub pending: Vec<PathBuf>,
    /// Paths waiting for the next drain, in drain order.
    pub queued: Vec<PathBuf>,
    /// Whether a drain is running.
    pub draining: bool,
}

enum Command {
    Schedule(PathBuf),
    Cancel(PathBuf),
    ReloadNow(PathBuf),
    ClearQueue,
    Status(oneshot::Sender<ReloadStatus>),
}

/// Handle to a running reload actor.
///
/// Clones share the actor. The actor stops when [`dispose`](Self::dispose)
/// is called or every handle is dropped.
#[derive(Clone)]
pub struct ReloadManager {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    debounce: Duration,
}

impl std::fmt::Debug for ReloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadManager")
            .field("debounce", &self.debounce)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl ReloadManager {
    /// Spawn the actor on the current Tokio runtime.
    ///
    /// Events are published to `bus` when one is given.
    #[must_use]
    pub fn spawn(
        handler: Arc<dyn ReloadHandler>,
        debounce: Duration,
        bus: Option<EventBus>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = Actor {
            handler,
            bus,
            debounce,
            cancel: cancel.clone(),
            pending: HashMap::new(),
            next_seq: 0,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            drains: JoinSet::new(),
        };
        tokio::spawn(actor.run(rx));
        debug!(debounce_ms = debounce.as_millis(), "reload manager started");
        Self {
            commands,
            cancel,
            debounce,
        }
    }

    /// Debounce interval.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    fn send(&self, command: Command) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.commands.send(command).is_err() {
            debug!("reload manager stopped, command dropped");
        }
    }

    /// Start or restart the debounce timer for `path`.
    pub fn schedule_reload(&self, path: impl Into<PathBuf>) {
        self.send(Command::Schedule(path.into()));
    }

    /// Forget `path` if it has not been drained yet.
    pub fn cancel_reload(&self, path: impl Into<PathBuf>) {
        self.send(Command::Cancel(path.into()));
    }

    /// Skip the debounce window and queue `path` immediately.
    pub fn reload_now(&self, path: impl Into<PathBuf>) {
        self.send(Command::ReloadNow(path.into()));
    }

    /// Drop every pending and queued path. A running drain is not affected.
    pub fn clear_queue(&self) {
        self.send(Command::ClearQueue);
    }

    /// Current queues, or `None` once the actor has stopped.
    pub async fn status(&self) -> Option<ReloadStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx));
        rx.await.ok()
    }

    /// Stop the actor. No reload fires afterwards.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            info!("reload manager disposed");
            self.cancel.cancel();
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the manager is disposed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

struct Actor {
    handler: Arc<dyn ReloadHandler>,
    bus: Option<EventBus>,
    debounce: Duration,
    cancel: CancellationToken,
    /// Deadline plus scheduling sequence, so equal deadlines keep call order.
    pending: HashMap<PathBuf, (Instant, u64)>,
    next_seq: u64,
    queue: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    drains: JoinSet<()>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next_deadline = self.pending.values().map(|(deadline, _)| *deadline).min();

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                Some(joined) = self.drains.join_next(), if !self.drains.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "reload drain aborted");
                    }
                    self.start_drain();
                }

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.expire(Instant::now());
                    self.start_drain();
                }

                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("reload manager handles dropped, stopping");
                        break;
                    }
                },
            }
        }

        self.pending.clear();
        self.queue.clear();
        self.queued.clear();
        // The in-flight file finishes; the drain skips the rest once cancelled.
        self.cancel.cancel();
        self.drains.detach_all();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule(path) => self.schedule(path),
            Command::Cancel(path) => {
                let was_pending = self.pending.remove(&path).is_some();
                let was_queued = self.queued.remove(&path);
                if was_queued {
                    self.queue.retain(|p| p != &path);
                }
                if was_pending || was_queued {
                    debug!(path = %path.display(), "reload cancelled");
                }
            },
            Command::ReloadNow(path) => {
                self.pending.remove(&path);
                self.enqueue(path);
                self.start_drain();
            },
            Command::ClearQueue => {
                debug!(
                    pending = self.pending.len(),
                    queued = self.queue.len(),
                    "reload queue cleared"
                );
                self.pending.clear();
                self.queue.clear();
                self.queued.clear();
            },
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            },
        }
    }

    fn schedule(&mut self, path: PathBuf) {
        if self.queued.contains(&path) {
            debug!(path = %path.display(), "already queued, not rescheduled");
            return;
        }
        #[allow(clippy::arithmetic_side_effects)]
        // Instant + Duration cannot overflow in practice
        let deadline = Instant::now() + self.debounce;
        debug!(path = %path.display(), "reload scheduled");
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending.insert(path.clone(), (deadline, seq));
        self.publish(RuntimeEvent::ReloadScheduled {
            metadata: EventMetadata::new("reload"),
            path,
        });
    }

    /// Move every expired path into the queue, earliest deadline first and
    /// in scheduling order among equal deadlines.
    fn expire(&mut self, now: Instant) {
        let mut ready: Vec<((Instant, u64), PathBuf)> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(path, key)| (*key, path.clone()))
            .collect();
        ready.sort_unstable_by_key(|(key, _)| *key);
        for (_, path) in ready {
            self.pending.remove(&path);
            self.enqueue(path);
        }
    }

    fn enqueue(&mut self, path: PathBuf) {
        if self.queued.insert(path.clone()) {
            self.queue.push_back(path);
        }
    }

    fn start_drain(&mut self) {
        if !self.drains.is_empty() || self.queue.is_empty() {
            return;
        }
        let batch: Vec<PathBuf> = self.queue.drain(..).collect();
        self.queued.clear();
        debug!(files = batch.len(), "reload drain started");
        self.drains.spawn(drain(
            Arc::clone(&self.handler),
            self.bus.clone(),
            self.cancel.clone(),
            batch,
        ));
    }

    fn status(&self) -> ReloadStatus {
        let mut pending: Vec<((Instant, u64), PathBuf)> = self
            .pending
            .iter()
            .map(|(path, key)| (*key, path.clone()))
            .collect();
        pending.sort_unstable_by_key(|(key, _)| *key);
        ReloadStatus {
            pending: pending.into_iter().map(|(_, path)| path).collect(),
            queued: self.queue.iter().cloned().collect(),
            draining: !self.drains.is_empty(),
        }
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

/// Process one batch in order. A failing file never stops the batch.
async fn drain(
    handler: Arc<dyn ReloadHandler>,
    bus: Option<EventBus>,
    cancel: CancellationToken,
    batch: Vec<PathBuf>,
) {
    let publish = |event: RuntimeEvent| {
        if let Some(bus) = &bus {
            bus.publish(event);
        }
    };

    let mut processed = Vec::with_capacity(batch.len());
    for path in batch {
        if cancel.is_cancelled() {
            debug!(path = %path.display(), "reload manager disposed, skipping rest of batch");
            break;
        }
        publish(RuntimeEvent::ReloadFile {
            metadata: EventMetadata::new("reload"),
            path: path.clone(),
        });

        let outcome = AssertUnwindSafe(handler.reload_file(&path))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panicked: {}", panic_message(&*payload))),
        };
        if let Some(error) = error {
            warn!(path = %path.display(), error = %error, "reload failed");
            publish(RuntimeEvent::ReloadFailed {
                metadata: EventMetadata::new("reload"),
                path: path.clone(),
                error,
            });
        }
        processed.push(path);
    }

    if processed.is_empty() {
        return;
    }
    info!(files = processed.len(), "reload batch completed");
    publish(RuntimeEvent::ReloadBatchCompleted {
        metadata: EventMetadata::new("reload"),
        paths: processed.clone(),
    });
    let completed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        handler.batch_completed(&processed);
    }));
    if let Err(payload) = completed {
        warn!(error = %panic_message(&*payload), "batch completion hook panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::RuntimeError;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<PathBuf>>,
        finished: Mutex<Vec<PathBuf>>,
        batches: Mutex<Vec<Vec<PathBuf>>>,
        fail: HashSet<PathBuf>,
        delay: Duration,
    }

    impl Recorder {
        fn failing(paths: &[&str]) -> Self {
            Self {
                fail: paths.iter().map(PathBuf::from).collect(),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<PathBuf> {
            self.calls.lock().unwrap().clone()
        }

        fn finished(&self) -> Vec<PathBuf> {
            self.finished.lock().unwrap().clone()
        }

        fn batches(&self) -> Vec<Vec<PathBuf>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReloadHandler for Recorder {
        async fn reload_file(&self, path: &Path) -> RuntimeResult<()> {
            self.calls.lock().unwrap().push(path.to_path_buf());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.finished.lock().unwrap().push(path.to_path_buf());
            if self.fail.contains(path) {
                return Err(RuntimeError::Execution {
                    path: path.to_path_buf(),
                    message: "boom".into(),
                });
            }
            Ok(())
        }

        fn batch_completed(&self, paths: &[PathBuf]) {
            self.batches.lock().unwrap().push(paths.to_vec());
        }
    }

    const DEBOUNCE: Duration = Duration::from_millis(100);

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_schedules_collapse() {
        let recorder = Arc::new(Recorder::default());
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, None);

        for _ in 0..5 {
            manager.schedule_reload("/plugins/a");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(recorder.calls().is_empty());

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        assert_eq!(recorder.calls(), vec![PathBuf::from("/plugins/a")]);
        assert_eq!(recorder.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_keeps_insertion_order_and_survives_failure() {
        let recorder = Arc::new(Recorder::failing(&["/plugins/a"]));
        let bus = EventBus::new();
        let mut failures = bus.subscribe_type("reload_failed");
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, Some(bus));

        manager.schedule_reload("/plugins/a");
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.schedule_reload("/plugins/b");
        tokio::time::sleep(DEBOUNCE * 3).await;
        settle().await;

        let calls = recorder.calls();
        assert_eq!(
            calls,
            vec![PathBuf::from("/plugins/a"), PathBuf::from("/plugins/b")]
        );
        let failed = failures.recv().await.unwrap();
        assert_eq!(failed.path(), Some(&PathBuf::from("/plugins/a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_clear() {
        let recorder = Arc::new(Recorder::default());
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, None);

        manager.schedule_reload("/plugins/a");
        manager.schedule_reload("/plugins/b");
        manager.cancel_reload("/plugins/a");
        let status = manager.status().await.unwrap();
        assert_eq!(status.pending, vec![PathBuf::from("/plugins/b")]);

        manager.clear_queue();
        let status = manager.status().await.unwrap();
        assert!(status.pending.is_empty());

        tokio::time::sleep(DEBOUNCE * 3).await;
        settle().await;
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_now_skips_debounce() {
        let recorder = Arc::new(Recorder::default());
        let manager = ReloadManager::spawn(recorder.clone(), Duration::from_secs(60), None);

        manager.reload_now("/plugins/a");
        settle().await;
        assert_eq!(recorder.calls(), vec![PathBuf::from("/plugins/a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_future_reloads() {
        let recorder = Arc::new(Recorder::default());
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, None);

        manager.schedule_reload("/plugins/a");
        manager.dispose();
        assert!(manager.is_disposed());
        manager.schedule_reload("/plugins/b");

        tokio::time::sleep(DEBOUNCE * 3).await;
        settle().await;
        assert!(recorder.calls().is_empty());
        assert!(manager.status().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_deadlines_drain_in_schedule_order() {
        let recorder = Arc::new(Recorder::default());
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, None);

        manager.schedule_reload("/plugins/b");
        manager.schedule_reload("/plugins/a");
        manager.schedule_reload("/plugins/c");
        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;

        assert_eq!(
            recorder.batches(),
            vec![vec![
                PathBuf::from("/plugins/b"),
                PathBuf::from("/plugins/a"),
                PathBuf::from("/plugins/c"),
            ]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_paths_expiring_mid_drain_wait_for_next_batch() {
        let recorder = Arc::new(Recorder::slow(Duration::from_millis(300)));
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, None);

        manager.schedule_reload("/plugins/a");
        // The first drain starts at 100ms and holds until 400ms.
        tokio::time::sleep(Duration::from_millis(110)).await;
        manager.schedule_reload("/plugins/a");
        manager.schedule_reload("/plugins/b");

        tokio::time::sleep(Duration::from_millis(140)).await;
        let status = manager.status().await.unwrap();
        assert!(status.draining);
        assert_eq!(
            status.queued,
            vec![PathBuf::from("/plugins/a"), PathBuf::from("/plugins/b")]
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(
            recorder.batches(),
            vec![
                vec![PathBuf::from("/plugins/a")],
                vec![PathBuf::from("/plugins/a"), PathBuf::from("/plugins/b")],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_mid_drain_finishes_current_file_only() {
        let recorder = Arc::new(Recorder::slow(Duration::from_millis(300)));
        let bus = EventBus::new();
        let mut completed = bus.subscribe_type("reload_batch_completed");
        let manager = ReloadManager::spawn(recorder.clone(), DEBOUNCE, Some(bus));

        manager.schedule_reload("/plugins/x");
        manager.schedule_reload("/plugins/y");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.calls(), vec![PathBuf::from("/plugins/x")]);
        assert!(recorder.finished().is_empty());

        manager.dispose();
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(recorder.calls(), vec![PathBuf::from("/plugins/x")]);
        assert_eq!(recorder.finished(), vec![PathBuf::from("/plugins/x")]);
        assert_eq!(recorder.batches(), vec![vec![PathBuf::from("/plugins/x")]]);
        let event = completed.try_recv().unwrap();
        assert!(matches!(
            event.as_ref(),
            RuntimeEvent::ReloadBatchCompleted { paths, .. } if paths == &[PathBuf::from("/plugins/x")]
        ));
    }
}
