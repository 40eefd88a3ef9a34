//! Worker coordinator - one background thread per job kind

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};

use super::cancel::CancellationToken;

/// Named category of background work; jobs of one kind never overlap
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKind(Cow<'static, str>);

impl JobKind {
    pub const PAGE_RENDER: JobKind = JobKind(Cow::Borrowed("page-render"));
    pub const THUMBNAIL: JobKind = JobKind(Cow::Borrowed("thumbnail"));
    pub const CACHE_CLEANUP: JobKind = JobKind(Cow::Borrowed("cache-cleanup"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the job slot for one kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Did not exit within the grace period and was abandoned
    Aborted,
}

/// Progress or terminal outcome reported by a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobUpdate {
    Progress { current: usize, total: usize },
    Succeeded(String),
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct JobEvent {
    pub kind: JobKind,
    pub generation: u64,
    pub update: JobUpdate,
}

/// What a job body returns: a success message or any error
pub type JobResult = Result<String, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job {kind} did not stop within {waited:?}")]
    Timeout { kind: JobKind, waited: Duration },

    #[error("job {kind} was abandoned and is still running")]
    Leaked { kind: JobKind },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Teardown bounds for background jobs
#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    /// How long `stop_job` waits for a cooperative exit
    pub stop_grace: Duration,
    /// Extra wait after escalation before the job is declared leaked
    pub forced_stop: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(3),
            forced_stop: Duration::from_secs(1),
        }
    }
}

/// Handle given to a running job body
#[derive(Clone)]
pub struct JobContext {
    kind: JobKind,
    generation: u64,
    token: CancellationToken,
    muted: Arc<AtomicBool>,
    events: Sender<JobEvent>,
}

impl JobContext {
    #[must_use]
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Safe-point check; call between units of work
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancellation-aware sleep; returns `true` if cancelled
    pub fn wait(&self, timeout: Duration) -> bool {
        self.token.wait(timeout)
    }

    /// True once the coordinator abandoned this job; its output is dropped
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn progress(&self, current: usize, total: usize) {
        self.report(JobUpdate::Progress { current, total });
    }

    /// Send a job-specific event unless the job has been abandoned
    pub fn emit<T>(&self, tx: &Sender<T>, event: T) -> bool {
        !self.is_muted() && tx.send(event).is_ok()
    }

    fn report(&self, update: JobUpdate) {
        let event = JobEvent {
            kind: self.kind.clone(),
            generation: self.generation,
            update,
        };
        self.emit(&self.events, event);
    }
}

/// Shared handles of one job, cloned out so stops can wait without the map lock
#[derive(Clone)]
struct JobControl {
    generation: u64,
    token: CancellationToken,
    muted: Arc<AtomicBool>,
    state: Arc<Mutex<JobState>>,
    done_rx: Receiver<()>,
}

impl JobControl {
    fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn has_exited(&self) -> bool {
        matches!(
            self.done_rx.try_recv(),
            Ok(()) | Err(TryRecvError::Disconnected)
        )
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        matches!(
            self.done_rx.recv_timeout(timeout),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        )
    }
}

struct JobSlot {
    control: JobControl,
    handle: Option<JoinHandle<()>>,
}

impl JobSlot {
    fn join(mut self, kind: &JobKind) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Job {kind} thread panicked during teardown");
            }
        }
    }
}

type SlotMap = BTreeMap<JobKind, JobSlot>;

/// Runs background jobs, at most one active per [`JobKind`].
///
/// Starting a job of a kind that is already active first stops the running
/// one, so two writers never race on the same cache. Cancellation is
/// cooperative; a job that ignores it is abandoned, muted and reported.
///
/// Start and stop calls for one kind are serialized by a per-kind lock held
/// across the bounded stop wait. The slot map itself is only locked briefly,
/// so stopping one kind never stalls calls for another.
pub struct WorkerCoordinator {
    config: WorkerConfig,
    jobs: Mutex<SlotMap>,
    kind_locks: Mutex<BTreeMap<JobKind, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
    events_tx: Sender<JobEvent>,
    events_rx: Receiver<JobEvent>,
}

impl Default for WorkerCoordinator {
    fn default() -> Self {
        Self::new(WorkerConfig::default())
    }
}

impl WorkerCoordinator {
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            config,
            jobs: Mutex::new(BTreeMap::new()),
            kind_locks: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(1),
            events_tx,
            events_rx,
        }
    }

    #[must_use]
    pub fn config(&self) -> WorkerConfig {
        self.config
    }

    /// Start `body` as the active job of `kind`, stopping any previous one.
    /// Returns the generation number tagged on the job's events.
    pub fn start_job<F>(&self, kind: JobKind, body: F) -> Result<u64, WorkerError>
    where
        F: FnOnce(&JobContext) -> JobResult + Send + 'static,
    {
        let serial = self.kind_lock(&kind);
        let _serial = serial.lock().unwrap_or_else(PoisonError::into_inner);

        self.retire(&kind, false)?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let muted = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(JobState::Starting));
        let (done_tx, done_rx) = flume::bounded(1);

        let ctx = JobContext {
            kind: kind.clone(),
            generation,
            token: token.clone(),
            muted: Arc::clone(&muted),
            events: self.events_tx.clone(),
        };
        let thread_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name(format!("job-{kind}"))
            .spawn(move || {
                run_job(&ctx, &thread_state, body);
                let _ = done_tx.send(());
            })?;

        info!("Started job {kind} (generation {generation})");
        self.slots().insert(
            kind,
            JobSlot {
                control: JobControl {
                    generation,
                    token,
                    muted,
                    state,
                    done_rx,
                },
                handle: Some(handle),
            },
        );

        Ok(generation)
    }

    /// Request cancellation of `kind` and wait for it within the configured
    /// bounds. A job still alive after both bounds is left `Aborted`.
    pub fn stop_job(&self, kind: &JobKind) -> Result<(), WorkerError> {
        let serial = self.kind_lock(kind);
        let _serial = serial.lock().unwrap_or_else(PoisonError::into_inner);
        self.retire(kind, true)
    }

    /// Stop whatever job is registered for `kind` and drop its slot. The map
    /// lock is released while waiting. An abandoned job is only waited on
    /// again when `wait_abandoned` is set; otherwise it is reported leaked.
    fn retire(&self, kind: &JobKind, wait_abandoned: bool) -> Result<(), WorkerError> {
        let control = {
            let mut jobs = self.slots();
            let Some(slot) = jobs.get(kind) else {
                return Ok(());
            };
            if slot.control.has_exited() {
                let finished = jobs.remove(kind);
                drop(jobs);
                if let Some(slot) = finished {
                    slot.join(kind);
                }
                return Ok(());
            }
            if slot.control.state() == JobState::Aborted && !wait_abandoned {
                return Err(WorkerError::Leaked { kind: kind.clone() });
            }
            debug!("Job {kind} still active, stopping it");
            slot.control.clone()
        };

        self.stop_control(kind, &control)?;

        let slot = self.slots().remove(kind);
        if let Some(slot) = slot {
            slot.join(kind);
        }
        Ok(())
    }

    fn stop_control(&self, kind: &JobKind, control: &JobControl) -> Result<(), WorkerError> {
        if control.state() == JobState::Aborted {
            if control.wait_exit(self.config.forced_stop) {
                info!("Abandoned job {kind} has exited");
                control.set_state(JobState::Idle);
                return Ok(());
            }
            return Err(WorkerError::Leaked { kind: kind.clone() });
        }

        if control.state() != JobState::Idle {
            control.set_state(JobState::Stopping);
        }
        control.token.cancel();

        if control.wait_exit(self.config.stop_grace) {
            control.set_state(JobState::Idle);
            debug!("Stopped job {kind} (generation {})", control.generation);
            return Ok(());
        }

        warn!(
            "Job {kind} did not stop within {:?}; abandoning it, state it was writing may be inconsistent",
            self.config.stop_grace
        );
        control.muted.store(true, Ordering::SeqCst);
        control.set_state(JobState::Aborted);

        if control.wait_exit(self.config.forced_stop) {
            warn!("Abandoned job {kind} exited during escalation");
            control.set_state(JobState::Idle);
            return Ok(());
        }

        let waited = self.config.stop_grace + self.config.forced_stop;
        error!("Job {kind} is unresponsive after {waited:?}; leaking its thread");
        Err(WorkerError::Timeout {
            kind: kind.clone(),
            waited,
        })
    }

    #[must_use]
    pub fn job_state(&self, kind: &JobKind) -> JobState {
        self.slots()
            .get(kind)
            .map_or(JobState::Idle, |slot| slot.control.state())
    }

    /// Generation of the job currently registered for `kind`
    #[must_use]
    pub fn current_generation(&self, kind: &JobKind) -> Option<u64> {
        self.slots().get(kind).map(|slot| slot.control.generation)
    }

    /// Kinds with a job that has not yet returned to idle
    #[must_use]
    pub fn active_kinds(&self) -> Vec<JobKind> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.control.state() != JobState::Idle)
            .map(|(kind, _)| kind.clone())
            .collect()
    }

    /// Stop every job in kind order; safe to call repeatedly
    pub fn cleanup(&self) {
        let kinds: Vec<JobKind> = self.slots().keys().cloned().collect();

        for kind in kinds {
            if let Err(e) = self.stop_job(&kind) {
                error!("Cleanup could not stop job {kind}: {e}");
            }
        }
    }

    #[must_use]
    pub fn events(&self) -> Receiver<JobEvent> {
        self.events_rx.clone()
    }

    /// Drain pending job events
    pub fn poll_events(&self) -> Vec<JobEvent> {
        self.events_rx.try_iter().collect()
    }

    fn slots(&self) -> MutexGuard<'_, SlotMap> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kind_lock(&self, kind: &JobKind) -> Arc<Mutex<()>> {
        let mut locks = self
            .kind_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(kind.clone()).or_default())
    }
}

impl Drop for WorkerCoordinator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn run_job<F>(ctx: &JobContext, state: &Mutex<JobState>, body: F)
where
    F: FnOnce(&JobContext) -> JobResult,
{
    {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == JobState::Starting {
            *state = JobState::Running;
        }
    }

    let update = match catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(Ok(message)) => JobUpdate::Succeeded(message),
        Ok(Err(e)) => {
            warn!("Job {} failed: {e}", ctx.kind);
            JobUpdate::Failed(e.to_string())
        }
        Err(_) => {
            error!("Job {} panicked", ctx.kind);
            JobUpdate::Failed("job panicked".to_string())
        }
    };
    ctx.report(update);

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state == JobState::Aborted {
        info!("Abandoned job {} finished late", ctx.kind);
    }
    *state = JobState::Idle;
}
