//! Background reception into a queue

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::CanError;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::bus::BusHandle;
use crate::frame::Frame;

/// Destination of a [`CyclicReceiveTask`]
#[derive(Debug, Clone)]
pub enum FrameQueue {
    /// Waits for room when full
    Bounded(mpsc::Sender<Frame>),
    Unbounded(mpsc::UnboundedSender<Frame>),
}

impl FrameQueue {
    /// Returns `false` once the consumer has gone away
    async fn push(&self, frame: Frame) -> bool {
        match self {
            Self::Bounded(tx) => tx.send(frame).await.is_ok(),
            Self::Unbounded(tx) => tx.send(frame).is_ok(),
        }
    }
}

impl From<mpsc::Sender<Frame>> for FrameQueue {
    fn from(tx: mpsc::Sender<Frame>) -> Self {
        Self::Bounded(tx)
    }
}

impl From<mpsc::UnboundedSender<Frame>> for FrameQueue {
    fn from(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self::Unbounded(tx)
    }
}

struct ReceiveInner {
    cancel: CancellationToken,
    done: CancellationToken,
    received: AtomicU64,
}

/// Task that keeps reading a bus and pushes every frame into a queue
///
/// Transient receive failures are logged and reading continues; any other
/// failure, a closed queue, the duration limit or `stop()` end the task.
#[derive(Clone)]
pub struct CyclicReceiveTask {
    inner: Arc<ReceiveInner>,
}

impl CyclicReceiveTask {
    pub fn spawn(
        bus: Arc<dyn BusHandle>,
        queue: FrameQueue,
        timeout: Option<Duration>,
        duration: Option<Duration>,
        runtime: &Handle,
    ) -> Self {
        let inner = Arc::new(ReceiveInner {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            received: AtomicU64::new(0),
        });
        runtime.spawn(receive_loop(
            Arc::clone(&inner),
            bus,
            queue,
            timeout,
            duration,
        ));
        Self { inner }
    }

    /// Stop reading; an in-flight receive call is abandoned
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub async fn wait(&self) {
        self.inner.done.cancelled().await;
    }

    pub fn is_running(&self) -> bool {
        !self.inner.done.is_cancelled() && !self.inner.cancel.is_cancelled()
    }

    /// Number of frames handed to the queue so far
    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }
}

async fn receive_loop(
    inner: Arc<ReceiveInner>,
    bus: Arc<dyn BusHandle>,
    queue: FrameQueue,
    timeout: Option<Duration>,
    duration: Option<Duration>,
) {
    let _done = inner.done.clone().drop_guard();
    let deadline = duration.map(|duration| Instant::now() + duration);
    let cancel = inner.cancel.clone();
    debug!("Cyclic receive started on {}", bus.channel_info());

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = bus.recv(timeout) => result,
        };

        match result {
            Ok(Some(frame)) => {
                trace!("Queueing frame 0x{:X}", frame.arbitration_id());
                let pushed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    pushed = queue.push(frame) => pushed,
                };
                if !pushed {
                    debug!("Receive queue closed");
                    break;
                }
                inner.received.fetch_add(1, Ordering::Relaxed);
            },
            Ok(None) => tokio::task::yield_now().await,
            Err(err @ CanError::Operation { .. }) => {
                warn!("Receive message failed: {}", err);
                tokio::task::yield_now().await;
            },
            Err(err) => {
                error!("Cyclic receive on {} aborted: {}", bus.channel_info(), err);
                break;
            },
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
    }

    debug!(
        "Cyclic receive on {} stopped after {} frames",
        bus.channel_info(),
        inner.received.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::virtual_bus::VirtualChannel;
    use crate::Bus;

    #[tokio::test]
    async fn test_frames_reach_queue() {
        let channel = VirtualChannel::new("vcan-rx");
        let rx_bus = Bus::new(channel.connect()).unwrap();
        let tx_bus = Bus::new(channel.connect()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = CyclicReceiveTask::spawn(
            Arc::new(rx_bus.clone()),
            tx.into(),
            Some(Duration::from_millis(10)),
            None,
            &Handle::current(),
        );

        for i in 0..3u8 {
            tx_bus.send(&Frame::new(0x42, &[i]).unwrap(), None).await.unwrap();
        }
        for i in 0..3u8 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.data(), &[i]);
        }

        task.stop();
        tokio::time::timeout(Duration::from_secs(1), task.wait())
            .await
            .unwrap();
        assert_eq!(task.received(), 3);
        rx_bus.shutdown().unwrap();
        tx_bus.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_duration_limit() {
        let channel = VirtualChannel::new("vcan-rx-duration");
        let bus = Bus::new(channel.connect()).unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let task = CyclicReceiveTask::spawn(
            Arc::new(bus.clone()),
            tx.into(),
            Some(Duration::from_millis(5)),
            Some(Duration::from_millis(30)),
            &Handle::current(),
        );
        tokio::time::timeout(Duration::from_secs(1), task.wait())
            .await
            .unwrap();
        assert!(!task.is_running());
        bus.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_bus_ends_task() {
        let channel = VirtualChannel::new("vcan-rx-shutdown");
        let bus = Bus::new(channel.connect()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let task = CyclicReceiveTask::spawn(
            Arc::new(bus.clone()),
            tx.into(),
            Some(Duration::from_millis(5)),
            None,
            &Handle::current(),
        );
        bus.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(1), task.wait())
            .await
            .unwrap();
    }
}
