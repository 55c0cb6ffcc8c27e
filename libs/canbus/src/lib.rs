//! CAN/CAN-FD bus runtime
//!
//! Runtime core shared by the test tooling that drives CAN hardware:
//! - [`Frame`] and the CAN-FD [`dlc`] table
//! - software receive filtering ([`filter`])
//! - the [`BusDriver`] contract implemented by hardware backends, wrapped by [`Bus`]
//! - [`ThreadSafeBus`], which serializes the send and receive paths independently
//! - periodic transmission ([`CyclicSendTask`]) and background reception ([`CyclicReceiveTask`])
//! - fan-out of received frames to listeners ([`Notifier`], [`NotificationRegistry`])
//!
//! Every long-running unit is a Tokio task; stopping one never waits for the
//! next frame or the rest of a period.

pub mod bus;
pub mod config;
pub mod cyclic;
pub mod dlc;
pub mod driver;
pub mod filter;
pub mod frame;
pub mod notifier;
pub mod thread_safe;
pub mod virtual_bus;

pub use bus::{Bus, BusHandle, BusId, Polled};
pub use config::{NotifierConfig, ReceiveConfig, RuntimeConfig};
pub use cyclic::{
    CyclicReceiveTask, CyclicSendTask, FrameQueue, OnSendError, PeriodicOptions, Schedule,
    TaskState,
};
pub use dlc::{dlc_to_length, length_to_dlc, CAN_FD_DLC};
pub use driver::{BusDriver, BusState, Pollable, RawDescriptor};
pub use filter::{CanFilter, FilterSet};
pub use frame::{Channel, Frame, FrameBuilder};
pub use notifier::{
    AsyncBufferedReader, AsyncListener, BufferedReader, Listener, NotificationRegistry, Notifier,
    NotifierOptions, ReaderKind, Recipient,
};
pub use thread_safe::ThreadSafeBus;
pub use virtual_bus::{VirtualChannel, VirtualDriver};

// Re-export the error taxonomy so drivers only need this crate
pub use errors::{CanError, CanResult};
