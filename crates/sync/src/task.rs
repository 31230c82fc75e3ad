//! Range completion tracking with a liveness watchdog.
//!
//! A [`RangeTask`] follows a contiguous range of heights that are fetched and
//! applied concurrently. Heights may be reported in any order and more than
//! once; the task collapses the completed prefix and fires its callback
//! exactly once per episode, either when the whole range is done or when no
//! progress was reported for `timeout`.
//!
//! ```text
//!            start(valid)
//!   Idle ─────────────────────► Running ──┐ start(..) → AlreadyRunning
//!    ▲                            │  ▲    │
//!    │   prefix reaches end       │  └────┘
//!    ├────────────────────────────┤
//!    │   no progress for timeout  │
//!    └────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use core_crate::{Height, SyncError};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Action invoked when an episode stops
type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Completed,
    TimedOut,
}

/// A consistent view of the task's cursor.
///
/// The callback carries no reason, so callers that need to tell a finished
/// range from a stalled one read a snapshot once the callback has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSnapshot {
    /// Whether an episode is active
    pub running: bool,

    /// Number of successful starts so far
    pub episode: u64,

    /// First height that has not been collapsed into the completed prefix
    pub start: Height,

    /// Last height of the current or most recent range
    pub end: Height,

    /// Heights reported ahead of `start`
    pub pending: usize,

    /// Whether the most recent episode finished its whole range
    pub complete: bool,
}

struct TaskState {
    running: bool,
    episode: u64,
    start: Height,
    end: Height,
    complete: bool,
    pending: BTreeSet<Height>,
    // None while running means the episode cannot time out
    deadline: Option<Instant>,
    callback: Option<Callback>,
}

impl TaskState {
    /// Advance past `start` and every contiguous pending height after it.
    /// Returns true once the whole range is done.
    fn collapse(&mut self) -> bool {
        loop {
            if self.start == self.end {
                self.start = self.end.saturating_add(1);
                self.complete = true;
                return true;
            }
            self.start += 1;
            if !self.pending.remove(&self.start) {
                return false;
            }
        }
    }

    fn stop(&mut self, reason: StopReason) -> Option<Callback> {
        self.running = false;
        self.deadline = None;
        match reason {
            StopReason::Completed => info!(
                episode = self.episode,
                end = self.end,
                "Range task completed"
            ),
            StopReason::TimedOut => warn!(
                episode = self.episode,
                cursor = self.start,
                end = self.end,
                pending = self.pending.len(),
                "Range task timed out without progress"
            ),
        }
        self.callback.take()
    }

    fn armed(&self) -> Option<(u64, Instant)> {
        match (self.running, self.deadline) {
            (true, Some(deadline)) => Some((self.episode, deadline)),
            _ => None,
        }
    }
}

struct Shared {
    state: Mutex<TaskState>,
    wake: Notify,
    timeout: Duration,
    runtime: Handle,
}

impl Shared {
    // No user code runs under the lock, so a poisoned guard still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` when the deadline lies beyond what the clock can represent,
    /// in which case the episode never times out.
    fn next_deadline(&self) -> Option<Instant> {
        Instant::now().checked_add(self.timeout)
    }

    /// Stop the episode if its deadline really passed.
    fn expire(&self, episode: u64) -> Option<Callback> {
        let mut state = self.lock();
        if !state.running {
            debug!(
                episode,
                "Watchdog fired after range already finished, nothing to stop"
            );
            return None;
        }
        if state.episode != episode {
            debug!(
                episode,
                current = state.episode,
                "Watchdog fired for a previous episode"
            );
            return None;
        }
        match state.deadline {
            Some(deadline) if Instant::now() >= deadline => state.stop(StopReason::TimedOut),
            _ => None,
        }
    }

    fn dispatch(&self, callback: Option<Callback>) {
        if let Some(callback) = callback {
            self.runtime.spawn_blocking(callback);
        }
    }
}

/// Tracks completion of a height range and stops it on stall.
///
/// The task is long-lived and reusable: each successful [`RangeTask::start`]
/// begins a new episode that ends on completion or timeout. The watchdog
/// runs on the runtime that created the task and is aborted when the task is
/// dropped.
pub struct RangeTask {
    shared: Arc<Shared>,
    watchdog: JoinHandle<()>,
}

impl RangeTask {
    /// Create an idle task and spawn its watchdog.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        let runtime = Handle::current();
        let shared = Arc::new(Shared {
            state: Mutex::new(TaskState {
                running: false,
                episode: 0,
                start: 0,
                end: 0,
                complete: false,
                pending: BTreeSet::new(),
                deadline: None,
                callback: None,
            }),
            wake: Notify::new(),
            timeout,
            runtime: runtime.clone(),
        });

        let watchdog = runtime.spawn(watchdog(Arc::clone(&shared)));
        debug!(?timeout, "Created range task");

        Self { shared, watchdog }
    }

    /// Begin tracking `[start, end]`.
    ///
    /// A running task rejects any new range with [`SyncError::AlreadyRunning`],
    /// even when the requested range is itself invalid.
    pub fn start<F>(&self, start: Height, end: Height, callback: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.running {
                debug!(
                    start,
                    end,
                    active_start = state.start,
                    active_end = state.end,
                    "Rejecting range, task already running"
                );
                return Err(SyncError::AlreadyRunning);
            }
            if start > end {
                return Err(SyncError::InvalidRange { start, end });
            }

            state.running = true;
            state.episode += 1;
            state.start = start;
            state.end = end;
            state.complete = false;
            state.pending.clear();
            state.callback = Some(Box::new(callback));
            state.deadline = self.shared.next_deadline();

            info!(episode = state.episode, start, end, "Range task started");
        }

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Report a finished height.
    ///
    /// Reports for an idle task, for heights outside the active range and
    /// for heights already reported are ignored.
    pub fn done(&self, height: Height) {
        let callback = {
            let mut state = self.shared.lock();
            if !state.running || height < state.start || height > state.end {
                return;
            }

            if height > state.start {
                state.pending.insert(height);
                state.deadline = self.shared.next_deadline();
                debug!(height, cursor = state.start, "Recorded height ahead of cursor");
                return;
            }

            if state.collapse() {
                state.stop(StopReason::Completed)
            } else {
                state.deadline = self.shared.next_deadline();
                debug!(cursor = state.start, end = state.end, "Advanced range cursor");
                None
            }
        };

        self.shared.dispatch(callback);
    }

    /// Whether an episode is active
    pub fn in_progress(&self) -> bool {
        self.shared.lock().running
    }

    /// Copy out the current cursor
    pub fn snapshot(&self) -> RangeSnapshot {
        let state = self.shared.lock();
        RangeSnapshot {
            running: state.running,
            episode: state.episode,
            start: state.start,
            end: state.end,
            pending: state.pending.len(),
            complete: state.complete,
        }
    }

    /// The idle timeout after which a running episode is stopped
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }
}

impl fmt::Debug for RangeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeTask")
            .field("timeout", &self.shared.timeout)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Drop for RangeTask {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

async fn watchdog(shared: Arc<Shared>) {
    debug!("Range task watchdog started");

    loop {
        let armed = shared.lock().armed();
        let Some((episode, deadline)) = armed else {
            // Idle, or running without a representable deadline. A start
            // that raced with the check above left a permit behind.
            shared.wake.notified().await;
            continue;
        };

        sleep_until(deadline).await;

        let callback = shared.expire(episode);
        shared.dispatch(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tokio::sync::mpsc;

    const LONG: Duration = Duration::from_secs(60);

    fn counting_callback(
        tx: &mpsc::UnboundedSender<()>,
    ) -> impl FnOnce() + Send + 'static {
        let tx = tx.clone();
        move || {
            let _ = tx.send(());
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let task = RangeTask::new(LONG);
        task.start(5, 10, || {}).unwrap();

        assert!(matches!(
            task.start(1, 2, || {}),
            Err(SyncError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn already_running_takes_precedence_over_invalid_range() {
        let task = RangeTask::new(LONG);
        task.start(5, 10, || {}).unwrap();

        assert!(matches!(
            task.start(10, 5, || {}),
            Err(SyncError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn invalid_range_is_rejected_when_idle() {
        let task = RangeTask::new(LONG);

        assert!(matches!(
            task.start(10, 5, || {}),
            Err(SyncError::InvalidRange { start: 10, end: 5 })
        ));
        assert!(!task.in_progress());
    }

    #[tokio::test]
    async fn out_of_order_reports_collapse_into_prefix() {
        let task = RangeTask::new(LONG);
        task.start(5, 10, || {}).unwrap();

        task.done(7);
        task.done(6);
        assert_eq!(task.snapshot().start, 5);
        assert_eq!(task.snapshot().pending, 2);

        task.done(5);
        let snapshot = task.snapshot();
        assert_eq!(snapshot.start, 8);
        assert_eq!(snapshot.pending, 0);
        assert!(snapshot.running);
    }

    #[tokio::test]
    async fn completion_fires_callback_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(LONG);
        task.start(5, 10, counting_callback(&tx)).unwrap();

        for height in [9, 10, 5, 5, 7, 6, 8, 8, 10] {
            task.done(height);
        }

        rx.recv().await.unwrap();
        assert!(!task.in_progress());
        let snapshot = task.snapshot();
        assert!(snapshot.complete);
        assert_eq!(snapshot.start, 11);

        task.done(10);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reports_outside_range_or_while_idle_are_ignored() {
        let task = RangeTask::new(LONG);
        task.done(3);
        assert_eq!(task.snapshot().episode, 0);

        task.start(5, 10, || {}).unwrap();
        task.done(4);
        task.done(11);
        let snapshot = task.snapshot();
        assert_eq!(snapshot.start, 5);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn range_ending_at_max_height_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(LONG);
        task.start(u64::MAX - 1, u64::MAX, counting_callback(&tx))
            .unwrap();

        task.done(u64::MAX);
        task.done(u64::MAX - 1);

        rx.recv().await.unwrap();
        assert!(task.snapshot().complete);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_range_times_out_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(Duration::from_millis(100));
        task.start(1, 3, counting_callback(&tx)).unwrap();
        task.done(1);

        rx.recv().await.unwrap();
        let snapshot = task.snapshot();
        assert!(!snapshot.running);
        assert!(!snapshot.complete);
        assert_eq!(snapshot.start, 2);

        // Late reports after the forced stop change nothing.
        task.done(2);
        task.done(3);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(task.snapshot(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(Duration::from_millis(100));
        task.start(1, 10, counting_callback(&tx)).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        task.done(4);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(task.in_progress());

        task.done(1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(task.in_progress());

        let started = Instant::now();
        rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!task.in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deadline_does_not_stop_next_episode() {
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(Duration::from_millis(100));
        let origin = Instant::now();

        task.start(1, 1, counting_callback(&first_tx)).unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;
        task.done(1);
        first_rx.recv().await.unwrap();

        // The watchdog is still sleeping towards the first episode's deadline.
        task.start(1, 3, counting_callback(&second_tx)).unwrap();
        tokio::time::sleep_until(origin + Duration::from_millis(150)).await;
        assert!(task.in_progress());
        assert_eq!(task.snapshot().episode, 2);

        second_rx.recv().await.unwrap();
        assert!(Instant::now() >= origin + Duration::from_millis(190));
        assert!(!task.in_progress());
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(Duration::MAX);
        task.start(1, 3, counting_callback(&tx)).unwrap();
        task.done(2);

        tokio::time::sleep(Duration::from_secs(400 * 24 * 60 * 60)).await;
        assert!(task.in_progress());
        assert!(rx.try_recv().is_err());

        task.done(1);
        task.done(3);
        rx.recv().await.unwrap();
        assert!(task.snapshot().complete);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_year_timeout_is_not_shortened() {
        const DAY: Duration = Duration::from_secs(24 * 60 * 60);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(DAY * 400);
        let origin = Instant::now();
        task.start(1, 3, counting_callback(&tx)).unwrap();

        tokio::time::sleep(DAY * 399).await;
        assert!(task.in_progress());

        rx.recv().await.unwrap();
        assert!(origin.elapsed() >= DAY * 400);
        assert!(!task.snapshot().complete);
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_follows_episode_lifecycle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RangeTask::new(Duration::from_millis(50));
        assert!(!task.in_progress());

        task.start(1, 1, counting_callback(&tx)).unwrap();
        assert!(task.in_progress());
        task.done(1);
        assert!(!task.in_progress());
        rx.recv().await.unwrap();

        task.start(2, 5, counting_callback(&tx)).unwrap();
        assert!(task.in_progress());
        rx.recv().await.unwrap();
        assert!(!task.in_progress());
        assert_eq!(task.snapshot().episode, 2);
    }

    #[tokio::test]
    async fn callback_may_restart_the_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = Arc::new(RangeTask::new(LONG));

        let inner = Arc::clone(&task);
        task.start(1, 1, move || {
            let _ = tx.send(inner.start(2, 3, || {}).is_ok());
        })
        .unwrap();
        task.done(1);

        assert!(rx.recv().await.unwrap());
        let snapshot = task.snapshot();
        assert!(snapshot.running);
        assert_eq!((snapshot.start, snapshot.end), (2, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one() {
        let task = RangeTask::new(LONG);
        let accepted = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        std::thread::scope(|scope| {
            for i in 0..8u64 {
                let (task, accepted, barrier) = (&task, &accepted, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    match task.start(i, i + 10, || {}) {
                        Ok(()) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(SyncError::AlreadyRunning) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                });
            }
        });

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(task.snapshot().episode, 1);
    }
}
