//! Cyclic transmission and reception tasks

pub mod receive;
pub mod send;

pub use receive::{CyclicReceiveTask, FrameQueue};
pub use send::{CyclicSendTask, OnSendError, PeriodicOptions, Schedule, TaskState};

pub(crate) use send::{PeriodicTasks, SendLock, SpawnContext, Transmit};
