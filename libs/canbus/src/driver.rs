//! Driver contract implemented by hardware and virtual backends

use std::time::Duration;

use async_trait::async_trait;
use errors::{CanError, CanResult};
use serde::{Deserialize, Serialize};

use crate::filter::FilterSet;
use crate::frame::Frame;

/// OS descriptor a driver exposes for readiness notification
pub type RawDescriptor = std::os::raw::c_int;

/// Controller error state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Active,
    Passive,
    Error,
}

/// Optional capability: the driver becomes readable through an OS descriptor
///
/// A notifier running on a caller supplied event loop watches this descriptor
/// instead of polling the bus.
pub trait Pollable: Send + Sync {
    fn descriptor(&self) -> RawDescriptor;
}

/// Low level bus backend
///
/// Implementations do the hardware I/O; [`Bus`](crate::Bus) layers software
/// filtering, shutdown tracking and periodic transmission on top. All methods
/// take `&self` so a driver can be shared between the send path and the
/// receive path without an outer lock.
#[async_trait]
pub trait BusDriver: Send + Sync + 'static {
    /// Human readable description of the channel, used in logs
    fn channel_info(&self) -> String {
        "unknown".to_string()
    }

    /// Transmit a frame
    ///
    /// `None` blocks until the frame is queued. On timeout the driver returns
    /// [`CanError::Timeout`].
    async fn send(&self, frame: &Frame, timeout: Option<Duration>) -> CanResult<()>;

    /// Read the next frame from the hardware
    ///
    /// Returns the frame (if one arrived within `timeout`) together with a flag
    /// that is `true` when the hardware already applied the configured filters.
    async fn receive_internal(&self, timeout: Option<Duration>)
        -> CanResult<(Option<Frame>, bool)>;

    /// Push filters into the hardware. Drivers without hardware filtering keep
    /// the default and let the software filter do the work.
    fn set_filters(&self, _filters: Option<&FilterSet>) -> CanResult<()> {
        Ok(())
    }

    /// Discard frames queued for transmission
    fn flush_tx_buffer(&self) -> CanResult<()> {
        Ok(())
    }

    /// Release the hardware. Must tolerate repeated calls.
    fn shutdown(&self) -> CanResult<()> {
        Ok(())
    }

    fn state(&self) -> BusState {
        BusState::Active
    }

    fn set_state(&self, _state: BusState) -> CanResult<()> {
        Err(CanError::not_implemented("setting the bus state"))
    }

    /// Descriptor based readiness, if the backend has one
    fn pollable(&self) -> Option<&dyn Pollable> {
        None
    }
}
