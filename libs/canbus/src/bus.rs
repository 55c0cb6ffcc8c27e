//! Bus handle over a [`BusDriver`]
//!
//! [`Bus`] adds what every backend needs on top of raw I/O: the software
//! filter, shutdown tracking, the shared send lock and the bookkeeping for
//! cyclic tasks. It is a cheap clone handle; all clones talk to the same driver.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use errors::{CanError, CanResult};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cyclic::{
    CyclicReceiveTask, CyclicSendTask, FrameQueue, PeriodicOptions, PeriodicTasks, Schedule,
    SendLock, SpawnContext, Transmit,
};
use crate::driver::{BusDriver, BusState, RawDescriptor};
use crate::filter::{matches_filters, FilterSet};
use crate::frame::Frame;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a bus
///
/// Every clone of a [`Bus`] (and a [`ThreadSafeBus`](crate::ThreadSafeBus)
/// wrapping it) reports the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(u64);

impl BusId {
    pub(crate) fn next() -> Self {
        Self(NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus#{}", self.0)
    }
}

/// Outcome of one non-blocking read
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Frame(Frame),
    /// A frame was read but the filters rejected it; more may be pending
    Filtered,
    /// Nothing pending on the driver
    Empty,
}

/// What a notifier or a receive task needs from a bus
#[async_trait]
pub trait BusHandle: Send + Sync + 'static {
    fn id(&self) -> BusId;

    fn channel_info(&self) -> String;

    async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()>;

    /// Next frame passing the filters, or `None` once `timeout` expires
    async fn recv(&self, timeout: Option<Duration>) -> CanResult<Option<Frame>>;

    /// Read at most one frame without waiting
    async fn try_recv(&self) -> CanResult<Polled>;

    /// Readiness descriptor, when the driver has one
    fn descriptor(&self) -> Option<RawDescriptor>;
}

struct BusInner {
    id: BusId,
    driver: Arc<dyn BusDriver>,
    filters: RwLock<Option<FilterSet>>,
    periodic: Arc<PeriodicTasks>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
    cyclic_receive: Mutex<Option<CyclicReceiveTask>>,
    is_shutdown: AtomicBool,
    runtime: Handle,
}

impl BusInner {
    fn ensure_open(&self) -> CanResult<()> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(CanError::Shutdown(self.driver.channel_info()));
        }
        Ok(())
    }

    fn shutdown(&self) -> CanResult<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            debug!("{} is already shut down", self.driver.channel_info());
            return Ok(());
        }

        self.periodic.stop_all(true);
        if let Some(task) = self.cyclic_receive.lock().take() {
            task.stop();
        }
        let result = self.driver.shutdown();
        info!("{} shut down", self.driver.channel_info());
        result
    }
}

#[async_trait]
impl Transmit for BusInner {
    // The cyclic task holds the bus send lock around this call
    async fn transmit(&self, frame: &Frame) -> CanResult<()> {
        self.ensure_open()?;
        self.driver.send(frame, None).await
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Acquire) {
            warn!(
                "{} was not properly shut down",
                self.driver.channel_info()
            );
            if let Err(e) = self.shutdown() {
                warn!("Shutdown on drop failed: {}", e);
            }
        }
    }
}

/// Handle to an open bus
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Wrap a driver, spawning background work on the current Tokio runtime
    pub fn new<D: BusDriver>(driver: D) -> CanResult<Self> {
        Self::from_shared(Arc::new(driver))
    }

    /// Like [`Bus::new`] for a driver the caller keeps a handle to
    pub fn from_shared(driver: Arc<dyn BusDriver>) -> CanResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            CanError::Initialization(format!("no Tokio runtime available: {}", e))
        })?;
        Ok(Self::with_runtime(driver, runtime))
    }

    pub fn with_runtime(driver: Arc<dyn BusDriver>, runtime: Handle) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                id: BusId::next(),
                driver,
                filters: RwLock::new(None),
                periodic: Arc::new(PeriodicTasks::default()),
                send_lock: Arc::new(tokio::sync::Mutex::new(())),
                cyclic_receive: Mutex::new(None),
                is_shutdown: AtomicBool::new(false),
                runtime,
            }),
        };
        debug!("Opened {} on {}", bus.id(), bus.channel_info());
        bus
    }

    pub fn id(&self) -> BusId {
        self.inner.id
    }

    pub fn channel_info(&self) -> String {
        self.inner.driver.channel_info()
    }

    /// Shared handle for a notifier or a receive task
    pub fn handle(&self) -> Arc<dyn BusHandle> {
        Arc::new(self.clone())
    }

    pub fn driver(&self) -> &Arc<dyn BusDriver> {
        &self.inner.driver
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }

    /// Transmit a frame, serialized with every cyclic task of this bus
    pub async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()> {
        self.inner.ensure_open()?;
        let _guard = self.inner.send_lock.lock().await;
        self.inner.driver.send(frame, timeout).await
    }

    /// Receive the next frame that passes the filters
    ///
    /// Frames rejected by the software filter do not reset the clock: the
    /// call returns `None` once `timeout` has elapsed in total. `None` as
    /// timeout waits indefinitely.
    pub async fn recv(&self, timeout: Option<Duration>) -> CanResult<Option<Frame>> {
        self.inner.ensure_open()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let (frame, already_filtered) = self.inner.driver.receive_internal(remaining).await?;

            if let Some(frame) = frame {
                if self.accepts(&frame, already_filtered) {
                    return Ok(Some(frame));
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
        }
    }

    /// Read at most one frame without waiting
    ///
    /// Unlike `recv(Some(Duration::ZERO))` this tells a frame the filters
    /// rejected apart from an empty driver, so a readiness-driven reader knows
    /// when it has drained the descriptor.
    pub async fn try_recv(&self) -> CanResult<Polled> {
        self.inner.ensure_open()?;
        let (frame, already_filtered) =
            self.inner.driver.receive_internal(Some(Duration::ZERO)).await?;
        Ok(match frame {
            Some(frame) if self.accepts(&frame, already_filtered) => Polled::Frame(frame),
            Some(_) => Polled::Filtered,
            None => Polled::Empty,
        })
    }

    fn accepts(&self, frame: &Frame, already_filtered: bool) -> bool {
        let accepted = already_filtered || {
            let filters = self.inner.filters.read();
            matches_filters(frame, filters.as_ref())
        };
        if accepted {
            trace!("Received 0x{:X} on {}", frame.arbitration_id(), self.inner.id);
        }
        accepted
    }

    pub fn filters(&self) -> Option<FilterSet> {
        self.inner.filters.read().clone()
    }

    /// Replace the receive filters; `None` or an empty set accepts everything
    pub fn set_filters(&self, filters: Option<FilterSet>) -> CanResult<()> {
        let filters = filters.filter(|set| !set.is_empty());
        match self.inner.driver.set_filters(filters.as_ref()) {
            Ok(()) => {},
            Err(e) if e.is_not_implemented() => {
                debug!("{} filters in software only", self.channel_info());
            },
            Err(e) => return Err(e),
        }
        *self.inner.filters.write() = filters;
        Ok(())
    }

    pub fn flush_tx_buffer(&self) -> CanResult<()> {
        self.inner.driver.flush_tx_buffer()
    }

    pub fn state(&self) -> BusState {
        self.inner.driver.state()
    }

    pub fn set_state(&self, state: BusState) -> CanResult<()> {
        self.inner.driver.set_state(state)
    }

    pub fn fileno(&self) -> Option<RawDescriptor> {
        self.inner.driver.pollable().map(|p| p.descriptor())
    }

    /// Transmit `frames` in turn, one every `period`, until stopped or
    /// `duration` runs out
    pub fn send_periodic(
        &self,
        frames: Vec<Frame>,
        period: Duration,
        duration: Option<Duration>,
    ) -> CanResult<CyclicSendTask> {
        let options = PeriodicOptions {
            duration,
            ..PeriodicOptions::default()
        };
        self.send_periodic_with(frames, period, options)
    }

    /// Like [`Bus::send_periodic`] but the bus does not track the task
    pub fn send_periodic_unstored(
        &self,
        frames: Vec<Frame>,
        period: Duration,
        duration: Option<Duration>,
    ) -> CanResult<CyclicSendTask> {
        let options = PeriodicOptions {
            duration,
            store_task: false,
            ..PeriodicOptions::default()
        };
        self.send_periodic_with(frames, period, options)
    }

    /// Periodic transmission that keeps running through send failures for
    /// as long as `on_error` returns `true`
    pub fn send_periodic_with_handler<F>(
        &self,
        frames: Vec<Frame>,
        period: Duration,
        duration: Option<Duration>,
        on_error: F,
    ) -> CanResult<CyclicSendTask>
    where
        F: Fn(&CanError) -> bool + Send + Sync + 'static,
    {
        let options = PeriodicOptions {
            duration,
            ..PeriodicOptions::default()
        }
        .on_error(on_error);
        self.send_periodic_with(frames, period, options)
    }

    /// First `count` frames `initial_period` apart, then `subsequent_period`
    pub fn send_periodic_multirate(
        &self,
        frames: Vec<Frame>,
        count: u32,
        initial_period: Duration,
        subsequent_period: Duration,
    ) -> CanResult<CyclicSendTask> {
        let schedule = Schedule::MultiRate {
            count,
            initial_period,
            subsequent_period,
        };
        self.send_periodic_with(frames, schedule, PeriodicOptions::default())
    }

    pub fn send_periodic_with(
        &self,
        frames: Vec<Frame>,
        schedule: impl Into<Schedule>,
        options: PeriodicOptions,
    ) -> CanResult<CyclicSendTask> {
        let sink = Arc::downgrade(&self.inner);
        let sink: Weak<dyn Transmit> = sink;
        let lock = SendLock::Exclusive(Arc::clone(&self.inner.send_lock));
        self.spawn_periodic(frames, schedule.into(), options, sink, lock)
    }

    pub(crate) fn spawn_periodic(
        &self,
        frames: Vec<Frame>,
        schedule: Schedule,
        options: PeriodicOptions,
        sink: Weak<dyn Transmit>,
        send_lock: SendLock,
    ) -> CanResult<CyclicSendTask> {
        self.inner.ensure_open()?;
        let context = SpawnContext {
            bus: self.inner.id,
            sink,
            send_lock,
            owner: Arc::downgrade(&self.inner.periodic),
            runtime: self.inner.runtime.clone(),
        };
        let task = CyclicSendTask::spawn(frames, schedule, options, context)?;
        info!(
            "Started cyclic task 0x{:X} on {}, period {:?}",
            task.arbitration_id(),
            self.inner.id,
            task.period()
        );
        Ok(task)
    }

    /// Tasks started with `store_task` that have not been stopped individually
    pub fn periodic_tasks(&self) -> Vec<CyclicSendTask> {
        self.inner.periodic.snapshot()
    }

    /// Stop every tracked task; with `remove_tasks` they are also forgotten
    pub fn stop_all_periodic_tasks(&self, remove_tasks: bool) {
        self.inner.periodic.stop_all(remove_tasks);
    }

    /// Read this bus in the background, pushing frames into `queue`
    ///
    /// Starting a new receive task stops the previous one.
    pub fn recv_cyclic(
        &self,
        queue: impl Into<FrameQueue>,
        timeout: Option<Duration>,
        duration: Option<Duration>,
    ) -> CanResult<CyclicReceiveTask> {
        self.inner.ensure_open()?;
        let task = CyclicReceiveTask::spawn(
            self.handle(),
            queue.into(),
            timeout,
            duration,
            &self.inner.runtime,
        );
        if let Some(previous) = self.inner.cyclic_receive.lock().replace(task.clone()) {
            previous.stop();
        }
        Ok(task)
    }

    pub fn stop_cyclic_receive(&self) {
        if let Some(task) = self.inner.cyclic_receive.lock().take() {
            task.stop();
        }
    }

    /// Stop all tasks and release the driver. Safe to call more than once.
    pub fn shutdown(&self) -> CanResult<()> {
        self.inner.shutdown()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.inner.id)
            .field("channel", &self.channel_info())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[async_trait]
impl BusHandle for Bus {
    fn id(&self) -> BusId {
        self.inner.id
    }

    fn channel_info(&self) -> String {
        Bus::channel_info(self)
    }

    async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()> {
        Bus::send(self, frame, timeout).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> CanResult<Option<Frame>> {
        Bus::recv(self, timeout).await
    }

    async fn try_recv(&self) -> CanResult<Polled> {
        Bus::try_recv(self).await
    }

    fn descriptor(&self) -> Option<RawDescriptor> {
        self.fileno()
    }
}
