//! Bus facade safe for concurrent senders and receivers
//!
//! Sends are serialized by one lock and receives by another, so a task blocked
//! in `recv` never holds up a sender. Operations touching both directions
//! (filters, state, shutdown) take both locks, always send lock first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use errors::CanResult;
use tokio::sync::{Mutex, MutexGuard};

use crate::bus::{Bus, BusHandle, BusId, Polled};
use crate::cyclic::{CyclicSendTask, PeriodicOptions, Schedule, SendLock, Transmit};
use crate::driver::{BusState, RawDescriptor};
use crate::filter::FilterSet;
use crate::frame::Frame;

struct SafeInner {
    bus: Bus,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl SafeInner {
    async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()> {
        let _send = self.send_lock.lock().await;
        self.bus.send(frame, timeout).await
    }

    async fn lock_both(&self) -> (MutexGuard<'_, ()>, MutexGuard<'_, ()>) {
        let send = self.send_lock.lock().await;
        let recv = self.recv_lock.lock().await;
        (send, recv)
    }
}

#[async_trait]
impl Transmit for SafeInner {
    async fn transmit(&self, frame: &Frame) -> CanResult<()> {
        self.send(frame, None).await
    }
}

/// Clone handle wrapping a [`Bus`] for use from many tasks at once
#[derive(Clone)]
pub struct ThreadSafeBus {
    inner: Arc<SafeInner>,
}

impl ThreadSafeBus {
    pub fn new(bus: Bus) -> Self {
        Self {
            inner: Arc::new(SafeInner {
                bus,
                send_lock: Mutex::new(()),
                recv_lock: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> BusId {
        self.inner.bus.id()
    }

    pub fn channel_info(&self) -> String {
        self.inner.bus.channel_info()
    }

    pub fn handle(&self) -> Arc<dyn BusHandle> {
        Arc::new(self.clone())
    }

    pub async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()> {
        self.inner.send(frame, timeout).await
    }

    pub async fn recv(&self, timeout: Option<Duration>) -> CanResult<Option<Frame>> {
        let _recv = self.inner.recv_lock.lock().await;
        self.inner.bus.recv(timeout).await
    }

    pub async fn try_recv(&self) -> CanResult<Polled> {
        let _recv = self.inner.recv_lock.lock().await;
        self.inner.bus.try_recv().await
    }

    /// Periodic transmission going through this facade's send lock
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

    pub fn send_periodic_with(
        &self,
        frames: Vec<Frame>,
        schedule: impl Into<Schedule>,
        options: PeriodicOptions,
    ) -> CanResult<CyclicSendTask> {
        let sink = Arc::downgrade(&self.inner);
        let sink: Weak<dyn Transmit> = sink;
        self.inner
            .bus
            .spawn_periodic(frames, schedule.into(), options, sink, SendLock::Passthrough)
    }

    pub fn periodic_tasks(&self) -> Vec<CyclicSendTask> {
        self.inner.bus.periodic_tasks()
    }

    pub fn stop_all_periodic_tasks(&self, remove_tasks: bool) {
        self.inner.bus.stop_all_periodic_tasks(remove_tasks);
    }

    pub async fn flush_tx_buffer(&self) -> CanResult<()> {
        let _send = self.inner.send_lock.lock().await;
        self.inner.bus.flush_tx_buffer()
    }

    pub async fn filters(&self) -> Option<FilterSet> {
        let _locks = self.inner.lock_both().await;
        self.inner.bus.filters()
    }

    pub async fn set_filters(&self, filters: Option<FilterSet>) -> CanResult<()> {
        let _locks = self.inner.lock_both().await;
        self.inner.bus.set_filters(filters)
    }

    pub async fn state(&self) -> BusState {
        let _locks = self.inner.lock_both().await;
        self.inner.bus.state()
    }

    pub async fn set_state(&self, state: BusState) -> CanResult<()> {
        let _locks = self.inner.lock_both().await;
        self.inner.bus.set_state(state)
    }

    /// Waits for in-flight sends and receives before releasing the bus
    pub async fn shutdown(&self) -> CanResult<()> {
        let _locks = self.inner.lock_both().await;
        self.inner.bus.shutdown()
    }
}

#[async_trait]
impl BusHandle for ThreadSafeBus {
    fn id(&self) -> BusId {
        ThreadSafeBus::id(self)
    }

    fn channel_info(&self) -> String {
        ThreadSafeBus::channel_info(self)
    }

    async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()> {
        ThreadSafeBus::send(self, frame, timeout).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> CanResult<Option<Frame>> {
        ThreadSafeBus::recv(self, timeout).await
    }

    async fn try_recv(&self) -> CanResult<Polled> {
        ThreadSafeBus::try_recv(self).await
    }

    fn descriptor(&self) -> Option<RawDescriptor> {
        self.inner.bus.fileno()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::filter::CanFilter;
    use crate::virtual_bus::VirtualChannel;

    #[tokio::test]
    async fn test_shares_bus_identity() {
        let channel = VirtualChannel::new("vcan-safe-id");
        let bus = Bus::new(channel.connect()).unwrap();
        let safe = ThreadSafeBus::new(bus.clone());
        assert_eq!(safe.id(), bus.id());
        assert_eq!(BusHandle::id(&safe.clone()), bus.id());
        safe.shutdown().await.unwrap();
        assert!(bus.is_shutdown());
    }

    #[tokio::test]
    async fn test_filters_round_trip() {
        let channel = VirtualChannel::new("vcan-safe-filters");
        let safe = ThreadSafeBus::new(Bus::new(channel.connect()).unwrap());
        let filters = FilterSet::from(vec![CanFilter::new(0x10, 0x7F0)]);
        safe.set_filters(Some(filters.clone())).await.unwrap();
        assert_eq!(safe.filters().await, Some(filters));
        safe.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_through_facade() {
        let channel = VirtualChannel::new("vcan-safe-periodic");
        let safe = ThreadSafeBus::new(Bus::new(channel.connect()).unwrap());
        let listener = Bus::new(channel.connect()).unwrap();

        let task = safe
            .send_periodic(
                vec![Frame::new(0x55, &[1]).unwrap()],
                Duration::from_millis(10),
                None,
            )
            .unwrap();
        assert_eq!(safe.periodic_tasks().len(), 1);

        let frame = listener
            .recv(Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.arbitration_id(), 0x55);

        task.stop();
        assert!(safe.periodic_tasks().is_empty());
        safe.shutdown().await.unwrap();
        listener.shutdown().unwrap();
    }
}
