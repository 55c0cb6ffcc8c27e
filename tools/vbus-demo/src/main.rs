//! vbus-demo - periodic traffic on an in-memory bus
//!
//! One bus transmits a rotating set of frames, a second bus on the same virtual
//! channel feeds a notifier, and every received frame is logged until Ctrl+C
//! or the transmit duration ends.
//!
//! Configuration comes from the file named by `CANBUS_CONFIG` (optional) and
//! `CANBUS_*` environment overrides.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use canbus::{
    Bus, BufferedReader, Frame, NotificationRegistry, Notifier, PeriodicOptions, Recipient,
    RuntimeConfig, VirtualChannel,
};
use tracing::{info, warn};

const CONFIG_PATH_VAR: &str = "CANBUS_CONFIG";
const CHANNEL: &str = "vcan0";
const ARBITRATION_ID: u32 = 0x123;
const PERIOD: Duration = Duration::from_millis(100);
const PAYLOADS: u8 = 4;

fn payloads(id: u32, count: u8) -> anyhow::Result<Vec<Frame>> {
    (0..count.max(1))
        .map(|seq| {
            Frame::new(id, &[seq, 0xCA, 0xFE])
                .with_context(|| format!("building frame {} for 0x{:X}", seq, id))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
    let config = RuntimeConfig::load(config_path.as_deref()).context("loading configuration")?;
    common::init_logging(&config.logging).context("initializing logging")?;
    let shutdown = common::shutdown_token();

    info!("Starting virtual bus demo on {}", CHANNEL);

    let channel = VirtualChannel::new(CHANNEL);
    let sender = Bus::new(channel.connect())?;
    let receiver = Bus::new(channel.connect())?;
    receiver.set_filters(config.filters.clone())?;

    let mut options = PeriodicOptions::default().on_error(|err| {
        warn!("Periodic send failed: {}", err);
        err.is_retryable()
    });
    options.duration = config.receive.duration();
    let task = sender.send_periodic_with(payloads(ARBITRATION_ID, PAYLOADS)?, PERIOD, options)?;

    let registry = NotificationRegistry::new();
    let reader = Arc::new(BufferedReader::new());
    let notifier = Notifier::with_buses(
        &registry,
        [receiver.handle()],
        [Recipient::listener(Arc::clone(&reader))],
        config.notifier.options(),
    )?;

    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.get_message(Some(config.receive.timeout())) => match frame {
                Some(frame) => {
                    received += 1;
                    info!("{}", frame);
                },
                None if !task.is_running() => {
                    info!("Periodic task finished");
                    break;
                },
                None => {},
            },
        }
    }

    task.stop();
    let stopped = notifier.stop(config.notifier.stop_timeout()).await;
    sender.shutdown()?;
    receiver.shutdown()?;
    stopped?;

    info!("Received {} frames", received);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_payloads_share_id() {
        let frames = payloads(0x321, 3).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.arbitration_id() == 0x321));
        assert_eq!(frames[2].data()[0], 2);
        assert_eq!(payloads(0x321, 0).unwrap().len(), 1);
    }
}
