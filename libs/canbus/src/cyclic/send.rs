//! Periodic frame transmission
//!
//! Each [`CyclicSendTask`] is a Tokio task that walks its frame list in order,
//! one frame per period. The wait between frames is a `select!` on the next due
//! time and the task's cancellation token, so `stop()` takes effect without
//! waiting for the period to run out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use errors::{invalid_argument, CanError, CanResult};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::BusId;
use crate::frame::{Channel, Frame};
use crate::notifier::NotificationRegistry;

/// Called with every failed send; returning `true` keeps the task running
pub type OnSendError = Arc<dyn Fn(&CanError) -> bool + Send + Sync>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Where a cyclic task delivers its frames
#[async_trait]
pub(crate) trait Transmit: Send + Sync {
    async fn transmit(&self, frame: &Frame) -> CanResult<()>;
}

/// Lock a task holds around each transmission
#[derive(Clone)]
pub(crate) enum SendLock {
    /// Shared with every other task and direct send of the same bus
    Exclusive(Arc<tokio::sync::Mutex<()>>),
    /// The sink serializes on its own
    Passthrough,
}

impl SendLock {
    async fn acquire(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match self {
            Self::Exclusive(lock) => Some(lock.lock().await),
            Self::Passthrough => None,
        }
    }
}

/// Timing of a cyclic task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Fixed(Duration),
    /// The first `count` frames go out `initial_period` apart, the rest
    /// `subsequent_period` apart
    MultiRate {
        count: u32,
        initial_period: Duration,
        subsequent_period: Duration,
    },
}

impl Schedule {
    /// Steady-state period
    pub fn period(&self) -> Duration {
        match self {
            Self::Fixed(period) => *period,
            Self::MultiRate {
                subsequent_period, ..
            } => *subsequent_period,
        }
    }

    /// Gap between frame number `sent` and the next one
    fn delay_after(&self, sent: u64) -> Duration {
        match self {
            Self::Fixed(period) => *period,
            Self::MultiRate {
                count,
                initial_period,
                subsequent_period,
            } => {
                if sent < u64::from(*count) {
                    *initial_period
                } else {
                    *subsequent_period
                }
            },
        }
    }

    fn validate(&self) -> CanResult<()> {
        let zero = match self {
            Self::Fixed(period) => period.is_zero(),
            Self::MultiRate {
                count,
                initial_period,
                subsequent_period,
            } => subsequent_period.is_zero() || (*count > 0 && initial_period.is_zero()),
        };
        if zero {
            return Err(invalid_argument!("period must be greater than zero"));
        }
        Ok(())
    }
}

impl From<Duration> for Schedule {
    fn from(period: Duration) -> Self {
        Self::Fixed(period)
    }
}

/// Options for starting a cyclic task
#[derive(Clone)]
pub struct PeriodicOptions {
    /// Stop after this long; `None` runs until stopped
    pub duration: Option<Duration>,
    /// Error hook; without one the first failed send ends the task
    pub on_error: Option<OnSendError>,
    /// Track the task on its bus so `stop_all_periodic_tasks` and shutdown reach it
    pub store_task: bool,
    /// Hand every transmitted frame to the notifier reading this bus in the
    /// registry, so listeners see periodic Tx traffic
    pub echo: Option<NotificationRegistry>,
}

impl Default for PeriodicOptions {
    fn default() -> Self {
        Self {
            duration: None,
            on_error: None,
            store_task: true,
            echo: None,
        }
    }
}

impl PeriodicOptions {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CanError) -> bool + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn unstored(mut self) -> Self {
        self.store_task = false;
        self
    }

    pub fn echo_to(mut self, registry: &NotificationRegistry) -> Self {
        self.echo = Some(registry.clone());
        self
    }
}

impl fmt::Debug for PeriodicOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicOptions")
            .field("duration", &self.duration)
            .field("on_error", &self.on_error.is_some())
            .field("store_task", &self.store_task)
            .field("echo", &self.echo.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Stopped,
}

/// Tasks a bus keeps track of
#[derive(Default)]
pub(crate) struct PeriodicTasks {
    tasks: Mutex<Vec<CyclicSendTask>>,
}

impl PeriodicTasks {
    fn insert(&self, task: &CyclicSendTask) {
        let mut tasks = self.tasks.lock();
        if !tasks.iter().any(|t| t.id() == task.id()) {
            tasks.push(task.clone());
        }
    }

    fn remove(&self, id: u64) {
        self.tasks.lock().retain(|t| t.id() != id);
    }

    pub(crate) fn snapshot(&self) -> Vec<CyclicSendTask> {
        self.tasks.lock().clone()
    }

    pub(crate) fn stop_all(&self, remove_tasks: bool) {
        let tasks = if remove_tasks {
            std::mem::take(&mut *self.tasks.lock())
        } else {
            self.snapshot()
        };
        for task in tasks {
            task.halt();
        }
    }
}

/// Everything a task needs from the bus that spawns it
pub(crate) struct SpawnContext {
    pub(crate) bus: BusId,
    pub(crate) sink: Weak<dyn Transmit>,
    pub(crate) send_lock: SendLock,
    pub(crate) owner: Weak<PeriodicTasks>,
    pub(crate) runtime: Handle,
}

struct Run {
    cancel: CancellationToken,
    // Cancelled when the task body exits, for whatever reason
    done: CancellationToken,
}

impl Run {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.done.is_cancelled()
    }
}

struct TaskInner {
    id: u64,
    bus: BusId,
    arbitration_id: u32,
    channel: Option<Channel>,
    frames: RwLock<Arc<[Frame]>>,
    schedule: Schedule,
    duration: Option<Duration>,
    on_error: Option<OnSendError>,
    stored: bool,
    echo: Option<NotificationRegistry>,
    sink: Weak<dyn Transmit>,
    send_lock: SendLock,
    owner: Weak<PeriodicTasks>,
    runtime: Handle,
    run: Mutex<Option<Run>>,
    last_error: Mutex<Option<CanError>>,
}

/// Handle to a periodic transmission
///
/// Clones refer to the same task.
#[derive(Clone)]
pub struct CyclicSendTask {
    inner: Arc<TaskInner>,
}

impl CyclicSendTask {
    pub(crate) fn spawn(
        frames: Vec<Frame>,
        schedule: Schedule,
        options: PeriodicOptions,
        context: SpawnContext,
    ) -> CanResult<Self> {
        schedule.validate()?;
        let first = check_frames(&frames)?;
        let arbitration_id = first.arbitration_id();
        let channel = first.channel().cloned();

        let task = Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                bus: context.bus,
                arbitration_id,
                channel,
                frames: RwLock::new(Arc::from(frames)),
                schedule,
                duration: options.duration,
                on_error: options.on_error,
                stored: options.store_task,
                echo: options.echo,
                sink: context.sink,
                send_lock: context.send_lock,
                owner: context.owner,
                runtime: context.runtime,
                run: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        };
        task.start();
        Ok(task)
    }

    /// Start or restart transmission; no-op while running
    pub fn start(&self) {
        {
            let mut run = self.inner.run.lock();
            if run.as_ref().is_some_and(Run::is_active) {
                return;
            }
            let cancel = CancellationToken::new();
            let done = CancellationToken::new();
            self.inner.runtime.spawn(run_cycle(
                Arc::clone(&self.inner),
                cancel.clone(),
                done.clone(),
            ));
            *run = Some(Run { cancel, done });
        }

        if self.inner.stored {
            if let Some(owner) = self.inner.owner.upgrade() {
                owner.insert(self);
            }
        }
    }

    /// Stop transmission and forget the task on its bus
    ///
    /// The pending wait is cancelled immediately; a frame already handed to the
    /// driver still completes. Stopping twice is harmless.
    pub fn stop(&self) {
        self.halt();
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.remove(self.inner.id);
        }
    }

    pub(crate) fn halt(&self) {
        if let Some(run) = self.inner.run.lock().as_ref() {
            run.cancel.cancel();
        }
    }

    /// Wait until the task body has exited
    pub async fn wait(&self) {
        let done = self.inner.run.lock().as_ref().map(|run| run.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
    }

    /// Replace the transmitted payloads
    ///
    /// The replacement must keep the frame count and the arbitration id. It is
    /// picked up by the next transmission without moving its due time.
    pub fn modify_data(&self, frames: Vec<Frame>) -> CanResult<()> {
        let first = check_frames(&frames)?;
        let mut current = self.inner.frames.write();
        if frames.len() != current.len() {
            return Err(invalid_argument!(
                "the number of frames cannot change: expected {}, got {}",
                current.len(),
                frames.len()
            ));
        }
        if !first.same_id(&current[0]) {
            return Err(invalid_argument!(
                "the arbitration id cannot change: 0x{:X} -> 0x{:X}",
                current[0].arbitration_id(),
                first.arbitration_id()
            ));
        }
        *current = Arc::from(frames);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Bus the task transmits on
    pub fn bus(&self) -> BusId {
        self.inner.bus
    }

    pub fn arbitration_id(&self) -> u32 {
        self.inner.arbitration_id
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.inner.channel.as_ref()
    }

    pub fn period(&self) -> Duration {
        self.inner.schedule.period()
    }

    pub fn schedule(&self) -> Schedule {
        self.inner.schedule
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.duration
    }

    /// Frames currently being transmitted
    pub fn frames(&self) -> Arc<[Frame]> {
        self.inner.frames.read().clone()
    }

    /// Most recent send failure, kept after the task stops
    pub fn last_error(&self) -> Option<CanError> {
        self.inner.last_error.lock().clone()
    }

    pub fn state(&self) -> TaskState {
        if self.is_running() {
            TaskState::Running
        } else {
            TaskState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().as_ref().is_some_and(Run::is_active)
    }
}

impl fmt::Debug for CyclicSendTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicSendTask")
            .field("id", &self.inner.id)
            .field("arbitration_id", &format_args!("0x{:X}", self.inner.arbitration_id))
            .field("schedule", &self.inner.schedule)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-empty, one arbitration id, one channel
fn check_frames(frames: &[Frame]) -> CanResult<&Frame> {
    let first = frames
        .first()
        .ok_or_else(|| invalid_argument!("must supply at least one frame"))?;
    if frames.iter().any(|frame| !frame.same_id(first)) {
        return Err(invalid_argument!(
            "all frames of a cyclic task must share arbitration id 0x{:X}",
            first.arbitration_id()
        ));
    }
    if frames.iter().any(|frame| frame.channel() != first.channel()) {
        return Err(invalid_argument!(
            "all frames of a cyclic task must use the same channel"
        ));
    }
    Ok(first)
}

/// Deliver a transmitted frame to the listeners of the notifier reading `bus`
fn echo_sent(registry: &NotificationRegistry, bus: BusId, frame: &Frame) {
    let Some(owner) = registry.owner(bus) else {
        return;
    };
    if !owner.serves(bus) {
        return;
    }
    if let Err(err) = owner.dispatch(frame) {
        warn!("Echo of 0x{:X} to listeners failed: {}", frame.arbitration_id(), err);
    }
}

async fn run_cycle(inner: Arc<TaskInner>, cancel: CancellationToken, done: CancellationToken) {
    let _done = done.drop_guard();
    let started = Instant::now();
    let deadline = inner.duration.map(|duration| started + duration);
    let mut due = started;
    let mut index = 0usize;
    let mut sent = 0u64;

    debug!(
        "Cyclic send task for 0x{:X} started, period {:?}",
        inner.arbitration_id,
        inner.schedule.period()
    );

    while !cancel.is_cancelled() {
        let frame = {
            let frames = inner.frames.read();
            frames[index % frames.len()].clone()
        }
        .stamped_now();

        let Some(sink) = inner.sink.upgrade() else {
            debug!("Bus of cyclic task 0x{:X} is gone", inner.arbitration_id);
            break;
        };
        let result = {
            let _guard = inner.send_lock.acquire().await;
            sink.transmit(&frame).await
        };
        drop(sink);

        if let Err(err) = result {
            warn!(
                "Cyclic send of 0x{:X} failed: {}",
                inner.arbitration_id, err
            );
            *inner.last_error.lock() = Some(err.clone());
            let keep_going = inner.on_error.as_ref().is_some_and(|handler| (**handler)(&err));
            if !keep_going {
                break;
            }
        } else if let Some(registry) = &inner.echo {
            echo_sent(registry, inner.bus, &frame);
        }

        sent += 1;
        index = (index + 1) % inner.frames.read().len();
        due += inner.schedule.delay_after(sent);

        // Never transmit past the duration limit
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline || due > deadline {
                break;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(due) => {},
        }
    }

    debug!(
        "Cyclic send task for 0x{:X} stopped after {} frames",
        inner.arbitration_id, sent
    );
}
