//! Shared fixtures for the integration tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use canbus::{Bus, BusDriver, CanError, CanResult, Frame};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Driver that records every send and replays scripted receive results
#[derive(Default)]
pub struct RecordingDriver {
    sent: Mutex<Vec<(Instant, Frame)>>,
    inbox: Mutex<VecDeque<CanResult<Frame>>>,
    arrived: Notify,
    in_send: AtomicBool,
    overlapping_sends: AtomicUsize,
    failing_sends: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a bus on a shared driver so the test keeps access to the recording
    pub fn open(self: &Arc<Self>) -> Bus {
        Bus::from_shared(Arc::clone(self) as Arc<dyn BusDriver>).unwrap()
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().iter().map(|(_, frame)| frame.clone()).collect()
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.sent.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Number of sends that started while another was still in progress
    pub fn overlapping_sends(&self) -> usize {
        self.overlapping_sends.load(Ordering::SeqCst)
    }

    /// Make the next `count` sends fail with an operation error
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn inject(&self, frame: Frame) {
        self.inbox.lock().push_back(Ok(frame));
        self.arrived.notify_one();
    }

    pub fn inject_error(&self, error: CanError) {
        self.inbox.lock().push_back(Err(error));
        self.arrived.notify_one();
    }

    async fn next_item(&self) -> CanResult<Frame> {
        loop {
            let arrived = self.arrived.notified();
            let next = self.inbox.lock().pop_front();
            if let Some(item) = next {
                return item;
            }
            arrived.await;
        }
    }
}

#[async_trait]
impl BusDriver for RecordingDriver {
    fn channel_info(&self) -> String {
        "recording stub".to_string()
    }

    async fn send(&self, frame: &Frame, _timeout: Option<Duration>) -> CanResult<()> {
        if self.in_send.swap(true, Ordering::SeqCst) {
            self.overlapping_sends.fetch_add(1, Ordering::SeqCst);
        }
        // Give a concurrent sender the chance to interleave
        tokio::task::yield_now().await;

        let fail = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if fail {
            Err(CanError::operation("injected send failure"))
        } else {
            self.sent.lock().push((Instant::now(), frame.clone()));
            Ok(())
        };

        self.in_send.store(false, Ordering::SeqCst);
        result
    }

    async fn receive_internal(
        &self,
        timeout: Option<Duration>,
    ) -> CanResult<(Option<Frame>, bool)> {
        let item = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.next_item()).await {
                Ok(item) => Some(item?),
                Err(_) => None,
            },
            None => Some(self.next_item().await?),
        };
        Ok((item, false))
    }

    fn shutdown(&self) -> CanResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn frame(id: u32, data: &[u8]) -> Frame {
    Frame::new(id, data).unwrap()
}

/// Poll `condition` until it holds or `within` elapses
pub async fn eventually<F: Fn() -> bool>(within: Duration, condition: F) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
