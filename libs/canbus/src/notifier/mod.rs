//! Fan-out of received frames to listeners
//!
//! A [`Notifier`] runs one receive loop per bus and hands every frame to its
//! listeners in registration order. Notifiers sharing a [`NotificationRegistry`]
//! never read the same bus twice: the second notifier to add a bus forwards
//! its listeners to the loop that already exists.
//!
//! # Example
//! ```ignore
//! let registry = NotificationRegistry::new();
//! let reader = Arc::new(BufferedReader::new());
//! let notifier = Notifier::new(&registry, NotifierOptions::default())?;
//! notifier.add_bus(bus.handle())?;
//! notifier.add_listener(Recipient::listener(Arc::clone(&reader)));
//! let frame = reader.get_message(Some(Duration::from_secs(1))).await;
//! notifier.stop(Duration::from_secs(5)).await?;
//! ```

mod listener;
mod registry;

pub use listener::{AsyncBufferedReader, AsyncListener, BufferedReader, Listener, Recipient};
pub use registry::NotificationRegistry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::{CanError, CanResult};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusHandle, BusId};
#[cfg(unix)]
use crate::bus::Polled;
#[cfg(unix)]
use crate::driver::RawDescriptor;
use crate::frame::Frame;
use registry::Claim;

/// Notifier settings
#[derive(Debug, Clone)]
pub struct NotifierOptions {
    /// Timeout of each receive call in the polling loop
    pub timeout: Duration,
    /// Caller supplied event loop. Receive loops and async listeners run on it,
    /// and buses exposing a descriptor are watched for readiness instead of
    /// being polled.
    pub event_loop: Option<Handle>,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            event_loop: None,
        }
    }
}

/// How a bus is being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Polling,
    Descriptor,
}

struct Reader {
    kind: ReaderKind,
    join: JoinHandle<CanResult<()>>,
}

pub(crate) struct NotifierShared {
    registry: NotificationRegistry,
    buses: Mutex<Vec<Arc<dyn BusHandle>>>,
    listeners: RwLock<Vec<Recipient>>,
    timeout: Duration,
    event_loop: Option<Handle>,
    runtime: Handle,
    readers: Mutex<HashMap<BusId, Reader>>,
    exceptions: Mutex<HashMap<BusId, CanError>>,
    running: CancellationToken,
    listeners_stopped: AtomicBool,
    // Swapped for the lock of a notifier that shares one of our buses
    dispatch_lock: Mutex<Arc<Mutex<()>>>,
}

impl NotifierShared {
    /// True while a live receive loop of this notifier reads `bus`
    pub(crate) fn serves(&self, bus: BusId) -> bool {
        !self.running.is_cancelled()
            && self
                .readers
                .lock()
                .get(&bus)
                .is_some_and(|reader| !reader.join.is_finished())
    }

    fn insert_listener(&self, recipient: Recipient) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|r| r.same_as(&recipient)) {
            return false;
        }
        listeners.push(recipient);
        true
    }

    fn remove_listener(&self, recipient: &Recipient) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| !r.same_as(recipient));
        listeners.len() != before
    }

    /// Owners of buses this notifier has but does not read itself
    fn foreign_owners(&self) -> Vec<Arc<NotifierShared>> {
        let buses: Vec<BusId> = self.buses.lock().iter().map(|bus| bus.id()).collect();
        buses
            .into_iter()
            .filter(|bus| !self.readers.lock().contains_key(bus))
            .filter_map(|bus| self.registry.owner(bus))
            .filter(|owner| !std::ptr::eq(owner.as_ref(), self))
            .collect()
    }

    fn start_reader(this: &Arc<Self>, bus: Arc<dyn BusHandle>) {
        let id = bus.id();

        #[cfg(unix)]
        if let (Some(event_loop), Some(fd)) = (this.event_loop.as_ref(), bus.descriptor()) {
            debug!("Watching descriptor {} of {}", fd, bus.channel_info());
            let join = event_loop.spawn(Arc::clone(this).watch_descriptor(bus, fd));
            this.readers.lock().insert(
                id,
                Reader {
                    kind: ReaderKind::Descriptor,
                    join,
                },
            );
            return;
        }

        debug!("Polling {} every {:?}", bus.channel_info(), this.timeout);
        let join = this.runtime.spawn(Arc::clone(this).poll_bus(bus));
        this.readers.lock().insert(
            id,
            Reader {
                kind: ReaderKind::Polling,
                join,
            },
        );
    }

    async fn poll_bus(self: Arc<Self>, bus: Arc<dyn BusHandle>) -> CanResult<()> {
        let outcome = self.poll_until_stopped(bus.as_ref()).await;
        self.finish_loop(bus.as_ref(), outcome)
    }

    async fn poll_until_stopped(&self, bus: &dyn BusHandle) -> CanResult<()> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.running.cancelled() => return Ok(()),
                received = bus.recv(Some(self.timeout)) => received?,
            };
            if let Some(frame) = received {
                self.dispatch(&frame)?;
            }
        }
    }

    #[cfg(unix)]
    async fn watch_descriptor(
        self: Arc<Self>,
        bus: Arc<dyn BusHandle>,
        fd: RawDescriptor,
    ) -> CanResult<()> {
        let outcome = self.watch_until_stopped(bus.as_ref(), fd).await;
        self.finish_loop(bus.as_ref(), outcome)
    }

    #[cfg(unix)]
    async fn watch_until_stopped(&self, bus: &dyn BusHandle, fd: RawDescriptor) -> CanResult<()> {
        use tokio::io::unix::AsyncFd;
        use tokio::io::Interest;

        let watched = AsyncFd::with_interest(WatchedDescriptor(fd), Interest::READABLE)?;
        loop {
            let mut ready = tokio::select! {
                biased;
                _ = self.running.cancelled() => return Ok(()),
                ready = watched.readable() => ready?,
            };
            // Readiness is edge-triggered: drain until the driver is empty
            loop {
                if self.running.is_cancelled() {
                    return Ok(());
                }
                match bus.try_recv().await? {
                    Polled::Frame(frame) => self.dispatch(&frame)?,
                    Polled::Filtered => {},
                    Polled::Empty => {
                        ready.clear_ready();
                        break;
                    },
                }
            }
        }
    }

    pub(crate) fn dispatch(&self, frame: &Frame) -> CanResult<()> {
        let lock = self.dispatch_lock.lock().clone();
        let _serialized = lock.lock();
        let listeners = self.listeners.read().clone();
        for recipient in &listeners {
            match recipient {
                Recipient::Sync(listener) => listener.on_message_received(frame)?,
                Recipient::Async(listener) => {
                    self.runtime
                        .spawn(listener.on_message_received(frame.clone()));
                },
            }
        }
        Ok(())
    }

    /// Offer the error to every listener; true if any handled it
    fn on_error(&self, error: &CanError) -> bool {
        let listeners = self.listeners.read().clone();
        let mut handled = false;
        for recipient in &listeners {
            match recipient.on_error(error) {
                Ok(()) => handled = true,
                Err(e) if e.is_not_implemented() => {},
                Err(e) => warn!("Listener error handler failed: {}", e),
            }
        }
        handled
    }

    fn finish_loop(&self, bus: &dyn BusHandle, outcome: CanResult<()>) -> CanResult<()> {
        let Err(error) = outcome else {
            debug!("Receive loop for {} stopped", bus.channel_info());
            return Ok(());
        };

        error!("Receive loop for {} failed: {}", bus.channel_info(), error);
        self.exceptions.lock().insert(bus.id(), error.clone());
        if self.on_error(&error) {
            info!("Error on {} handled by a listener", bus.channel_info());
            Ok(())
        } else {
            Err(error)
        }
    }
}

#[cfg(unix)]
struct WatchedDescriptor(RawDescriptor);

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for WatchedDescriptor {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0
    }
}

/// Dispatches frames from one or more buses to listeners
pub struct Notifier {
    shared: Arc<NotifierShared>,
}

impl Notifier {
    /// Notifier without buses or listeners
    ///
    /// Loops run on `options.event_loop` when given, otherwise on the current
    /// Tokio runtime.
    pub fn new(registry: &NotificationRegistry, options: NotifierOptions) -> CanResult<Self> {
        let runtime = match &options.event_loop {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|e| {
                CanError::Initialization(format!("no Tokio runtime available: {}", e))
            })?,
        };

        Ok(Self {
            shared: Arc::new(NotifierShared {
                registry: registry.clone(),
                buses: Mutex::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                timeout: options.timeout,
                event_loop: options.event_loop,
                runtime,
                readers: Mutex::new(HashMap::new()),
                exceptions: Mutex::new(HashMap::new()),
                running: CancellationToken::new(),
                listeners_stopped: AtomicBool::new(false),
                dispatch_lock: Mutex::new(Arc::new(Mutex::new(()))),
            }),
        })
    }

    /// Notifier reading `buses` on behalf of `listeners`
    pub fn with_buses(
        registry: &NotificationRegistry,
        buses: impl IntoIterator<Item = Arc<dyn BusHandle>>,
        listeners: impl IntoIterator<Item = Recipient>,
        options: NotifierOptions,
    ) -> CanResult<Self> {
        let notifier = Self::new(registry, options)?;
        for bus in buses {
            notifier.add_bus(bus)?;
        }
        for listener in listeners {
            notifier.add_listener(listener);
        }
        Ok(notifier)
    }

    /// Start delivering frames from `bus`
    ///
    /// If another notifier in the registry already reads the bus, no loop is
    /// started; this notifier's listeners are attached to that loop instead.
    pub fn add_bus(&self, bus: Arc<dyn BusHandle>) -> CanResult<()> {
        let shared = &self.shared;
        if shared.running.is_cancelled() {
            return Err(CanError::operation("notifier has been stopped"));
        }

        let id = bus.id();
        {
            let mut buses = shared.buses.lock();
            if buses.iter().any(|known| known.id() == id) {
                debug!("{} already added", id);
                return Ok(());
            }
            buses.push(Arc::clone(&bus));
        }

        let claim = shared.registry.claim(id, shared, || {
            NotifierShared::start_reader(shared, Arc::clone(&bus));
        });
        if let Claim::Shared(owner) = claim {
            warn!(
                "{} already has a receive loop, sharing it instead of starting another",
                bus.channel_info()
            );
            let lock = shared.dispatch_lock.lock().clone();
            *owner.dispatch_lock.lock() = lock;
            let listeners = shared.listeners.read().clone();
            for recipient in listeners {
                owner.insert_listener(recipient);
            }
        }
        Ok(())
    }

    /// Register a listener; adding the same listener twice has no effect
    pub fn add_listener(&self, recipient: Recipient) {
        for owner in self.shared.foreign_owners() {
            owner.insert_listener(recipient.clone());
        }
        self.shared.insert_listener(recipient);
    }

    /// Unregister a listener and clear its buffer. Returns whether it was registered.
    pub fn remove_listener(&self, recipient: &Recipient) -> bool {
        for owner in self.shared.foreign_owners() {
            owner.remove_listener(recipient);
        }
        recipient.clear_buffer();
        self.shared.remove_listener(recipient)
    }

    /// Stop all receive loops and listeners
    ///
    /// Each loop gets until `timeout` (shared across loops) to exit before it
    /// is aborted. Every listener's `stop` runs once. The first loop failure no
    /// listener handled is returned.
    pub async fn stop(&self, timeout: Duration) -> CanResult<()> {
        let shared = &self.shared;
        shared.running.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let readers: Vec<(BusId, Reader)> = shared.readers.lock().drain().collect();
        let mut first_error = None;

        for (bus, reader) in readers {
            shared.registry.release(bus, shared);
            let mut join = reader.join;
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(Ok(()))) => {},
                Ok(Ok(Err(error))) => {
                    first_error.get_or_insert(error);
                },
                Ok(Err(join_error)) => {
                    warn!("Receive loop for {} panicked: {}", bus, join_error);
                },
                Err(_) => {
                    warn!("Receive loop for {} did not stop within {:?}", bus, timeout);
                    join.abort();
                },
            }
        }

        if !shared.listeners_stopped.swap(true, Ordering::AcqRel) {
            let listeners = shared.listeners.read().clone();
            for recipient in listeners {
                recipient.stop();
            }
        }

        info!("Notifier stopped");
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shared.running.is_cancelled()
    }

    pub fn listeners(&self) -> Vec<Recipient> {
        self.shared.listeners.read().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().len()
    }

    pub fn buses(&self) -> Vec<BusId> {
        self.shared.buses.lock().iter().map(|bus| bus.id()).collect()
    }

    /// Receive-loop failures recorded per bus
    pub fn exceptions(&self) -> HashMap<BusId, CanError> {
        self.shared.exceptions.lock().clone()
    }

    /// How this notifier reads `bus`; `None` if another notifier reads it
    pub fn reader_kind(&self, bus: BusId) -> Option<ReaderKind> {
        self.shared.readers.lock().get(&bus).map(|reader| reader.kind)
    }

    pub fn has_reader(&self, bus: BusId) -> bool {
        self.shared.serves(bus)
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if !self.shared.running.is_cancelled() {
            debug!("Notifier dropped while running, cancelling receive loops");
        }
        self.shared.running.cancel();
        let buses: Vec<BusId> = self.shared.readers.lock().keys().copied().collect();
        for bus in buses {
            self.shared.registry.release(bus, &self.shared);
        }
    }
}
