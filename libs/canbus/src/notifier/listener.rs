//! Frame consumers attached to a [`Notifier`](super::Notifier)

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::{CanError, CanResult};
use futures::future::BoxFuture;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::frame::Frame;

/// Synchronous frame callback, invoked on the receive loop
pub trait Listener: Send + Sync + 'static {
    /// A returned error is treated like a receive failure of the bus the
    /// frame came from
    fn on_message_received(&self, frame: &Frame) -> CanResult<()>;

    /// Handle a receive-loop failure. Returning
    /// [`CanError::InterfaceNotImplemented`] means "not handled".
    fn on_error(&self, _error: &CanError) -> CanResult<()> {
        Err(CanError::not_implemented("on_error"))
    }

    /// Called once when the notifier stops
    fn stop(&self) {}

    /// Drop anything buffered; called when the listener is removed
    fn clear_buffer(&self) {}
}

/// Frame callback that runs as its own task on the notifier's runtime
pub trait AsyncListener: Send + Sync + 'static {
    fn on_message_received(&self, frame: Frame) -> BoxFuture<'static, ()>;

    fn on_error(&self, _error: &CanError) -> CanResult<()> {
        Err(CanError::not_implemented("on_error"))
    }

    fn stop(&self) {}

    fn clear_buffer(&self) {}
}

/// A registered listener
///
/// Two recipients are the same when they point at the same allocation, which
/// is what registration de-duplicates on.
#[derive(Clone)]
pub enum Recipient {
    Sync(Arc<dyn Listener>),
    Async(Arc<dyn AsyncListener>),
}

impl Recipient {
    pub fn listener<L: Listener>(listener: Arc<L>) -> Self {
        Self::Sync(listener)
    }

    pub fn async_listener<L: AsyncListener>(listener: Arc<L>) -> Self {
        Self::Async(listener)
    }

    /// Plain closure called for every frame
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(FnListener(callback)))
    }

    /// Async closure spawned for every frame
    pub fn from_async_fn<F, Fut>(callback: F) -> Self
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(AsyncFnListener(callback)))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    pub fn same_as(&self, other: &Recipient) -> bool {
        self.addr() == other.addr()
    }

    fn addr(&self) -> *const () {
        match self {
            Self::Sync(listener) => Arc::as_ptr(listener).cast::<()>(),
            Self::Async(listener) => Arc::as_ptr(listener).cast::<()>(),
        }
    }

    pub(crate) fn on_error(&self, error: &CanError) -> CanResult<()> {
        match self {
            Self::Sync(listener) => listener.on_error(error),
            Self::Async(listener) => listener.on_error(error),
        }
    }

    pub(crate) fn stop(&self) {
        match self {
            Self::Sync(listener) => listener.stop(),
            Self::Async(listener) => listener.stop(),
        }
    }

    pub(crate) fn clear_buffer(&self) {
        match self {
            Self::Sync(listener) => listener.clear_buffer(),
            Self::Async(listener) => listener.clear_buffer(),
        }
    }
}

impl From<Arc<dyn Listener>> for Recipient {
    fn from(listener: Arc<dyn Listener>) -> Self {
        Self::Sync(listener)
    }
}

impl From<Arc<dyn AsyncListener>> for Recipient {
    fn from(listener: Arc<dyn AsyncListener>) -> Self {
        Self::Async(listener)
    }
}

struct FnListener<F>(F);

impl<F> Listener for FnListener<F>
where
    F: Fn(&Frame) + Send + Sync + 'static,
{
    fn on_message_received(&self, frame: &Frame) -> CanResult<()> {
        (self.0)(frame);
        Ok(())
    }
}

struct AsyncFnListener<F>(F);

impl<F, Fut> AsyncListener for AsyncFnListener<F>
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_message_received(&self, frame: Frame) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(frame))
    }
}

/// Listener that buffers frames for a consumer to pull
#[derive(Default)]
pub struct BufferedReader {
    buffer: Mutex<VecDeque<Frame>>,
    arrived: Notify,
    stopped: AtomicBool,
}

impl BufferedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next buffered frame, waiting up to `timeout` for one to arrive
    ///
    /// Never waits once the reader has been stopped.
    pub async fn get_message(&self, timeout: Option<Duration>) -> Option<Frame> {
        let wait = async {
            loop {
                let arrived = self.arrived.notified();
                let next = self.buffer.lock().pop_front();
                if let Some(frame) = next {
                    return Some(frame);
                }
                if self.stopped.load(Ordering::Acquire) {
                    return None;
                }
                arrived.await;
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Listener for BufferedReader {
    fn on_message_received(&self, frame: &Frame) -> CanResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CanError::operation("reader has already been stopped"));
        }
        self.buffer.lock().push_back(frame.clone());
        self.arrived.notify_waiters();
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.arrived.notify_waiters();
    }

    fn clear_buffer(&self) {
        self.buffer.lock().clear();
    }
}

/// Buffered listener consumed with `.await` or as a [`Stream`]
pub struct AsyncBufferedReader {
    tx: mpsc::UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl Default for AsyncBufferedReader {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl AsyncBufferedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next frame
    pub async fn get_message(&self) -> Option<Frame> {
        self.rx.lock().await.recv().await
    }

    /// Endless stream of received frames
    pub fn stream(&self) -> impl Stream<Item = Frame> + '_ {
        futures::stream::unfold(self, |reader| async move {
            reader.get_message().await.map(|frame| (frame, reader))
        })
    }
}

impl Listener for AsyncBufferedReader {
    fn on_message_received(&self, frame: &Frame) -> CanResult<()> {
        self.tx
            .send(frame.clone())
            .map_err(|_| CanError::operation("async reader closed"))
    }

    fn clear_buffer(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}
