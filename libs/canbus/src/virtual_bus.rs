//! In-memory bus for tests and demos
//!
//! A [`VirtualChannel`] is a hub; every [`VirtualDriver`] connected to it sees
//! the frames sent by the others. Nothing leaves the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use errors::{CanError, CanResult};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::driver::{BusDriver, BusState};
use crate::frame::{Channel, Frame};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

struct Endpoint {
    id: u64,
    queue: Mutex<VecDeque<Frame>>,
    arrived: Notify,
    receive_own_messages: bool,
    closed: AtomicBool,
}

impl Endpoint {
    fn push(&self, frame: Frame) {
        self.queue.lock().push_back(frame);
        self.arrived.notify_one();
    }
}

struct ChannelInner {
    name: String,
    endpoints: Mutex<Vec<Weak<Endpoint>>>,
}

/// Shared medium of a set of virtual drivers
#[derive(Clone)]
pub struct VirtualChannel {
    inner: Arc<ChannelInner>,
}

impl VirtualChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// New endpoint that does not see its own frames
    pub fn connect(&self) -> VirtualDriver {
        self.connect_with(false)
    }

    pub fn connect_with(&self, receive_own_messages: bool) -> VirtualDriver {
        let endpoint = Arc::new(Endpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            receive_own_messages,
            closed: AtomicBool::new(false),
        });
        self.inner.endpoints.lock().push(Arc::downgrade(&endpoint));
        debug!("Endpoint {} connected to {}", endpoint.id, self.inner.name);

        VirtualDriver {
            channel: self.clone(),
            endpoint,
            state: Mutex::new(BusState::Active),
        }
    }

    /// Endpoints still connected
    pub fn endpoint_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .iter()
            .filter(|endpoint| endpoint.strong_count() > 0)
            .count()
    }

    fn deliver(&self, sender: u64, frame: &Frame) {
        let receivers: Vec<Arc<Endpoint>> = {
            let mut endpoints = self.inner.endpoints.lock();
            endpoints.retain(|endpoint| endpoint.strong_count() > 0);
            endpoints.iter().filter_map(Weak::upgrade).collect()
        };

        for endpoint in receivers {
            if endpoint.closed.load(Ordering::Acquire) {
                continue;
            }
            if endpoint.id == sender && !endpoint.receive_own_messages {
                continue;
            }
            endpoint.push(frame.clone());
        }
    }

    fn disconnect(&self, id: u64) {
        self.inner
            .endpoints
            .lock()
            .retain(|endpoint| endpoint.upgrade().is_some_and(|e| e.id != id));
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("name", &self.inner.name)
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}

/// Driver endpoint on a [`VirtualChannel`]
///
/// Received frames carry the channel name and the wall-clock time of the send.
/// Filtering is left to the software filter of [`Bus`](crate::Bus).
pub struct VirtualDriver {
    channel: VirtualChannel,
    endpoint: Arc<Endpoint>,
    state: Mutex<BusState>,
}

impl VirtualDriver {
    fn ensure_open(&self) -> CanResult<()> {
        if self.endpoint.closed.load(Ordering::Acquire) {
            return Err(CanError::operation(format!(
                "virtual endpoint on {} is closed",
                self.channel.name()
            )));
        }
        Ok(())
    }

    async fn next_frame(&self) -> CanResult<Frame> {
        loop {
            self.ensure_open()?;
            let arrived = self.endpoint.arrived.notified();
            let next = self.endpoint.queue.lock().pop_front();
            if let Some(frame) = next {
                return Ok(frame);
            }
            arrived.await;
        }
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.endpoint.queue.lock().len()
    }
}

#[async_trait]
impl BusDriver for VirtualDriver {
    fn channel_info(&self) -> String {
        format!("virtual channel {}", self.channel.name())
    }

    async fn send(&self, frame: &Frame, _timeout: Option<Duration>) -> CanResult<()> {
        self.ensure_open()?;
        let frame = frame
            .clone()
            .with_channel(Channel::from(self.channel.name()))
            .stamped_now();
        trace!(
            "Virtual send 0x{:X} on {}",
            frame.arbitration_id(),
            self.channel.name()
        );
        self.channel.deliver(self.endpoint.id, &frame);
        Ok(())
    }

    async fn receive_internal(
        &self,
        timeout: Option<Duration>,
    ) -> CanResult<(Option<Frame>, bool)> {
        let frame = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.next_frame()).await {
                Ok(frame) => Some(frame?),
                Err(_) => None,
            },
            None => Some(self.next_frame().await?),
        };
        Ok((frame, false))
    }

    fn shutdown(&self) -> CanResult<()> {
        if !self.endpoint.closed.swap(true, Ordering::AcqRel) {
            self.channel.disconnect(self.endpoint.id);
            self.endpoint.queue.lock().clear();
            self.endpoint.arrived.notify_waiters();
            debug!(
                "Endpoint {} left {}",
                self.endpoint.id,
                self.channel.name()
            );
        }
        Ok(())
    }

    fn state(&self) -> BusState {
        *self.state.lock()
    }

    fn set_state(&self, state: BusState) -> CanResult<()> {
        *self.state.lock() = state;
        Ok(())
    }
}
