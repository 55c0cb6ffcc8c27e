//! Receive path: software filters, FD frames and background reception
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use canbus::{dlc_to_length, Bus, CanFilter, FilterSet, Frame, VirtualChannel};
use common::{eventually, frame, RecordingDriver};
use tokio::sync::mpsc;

const WAIT: Option<Duration> = Some(Duration::from_millis(200));

#[tokio::test]
async fn test_filters_select_frames() {
    let channel = VirtualChannel::new("vcan-rx-filters");
    let rx = Bus::new(channel.connect()).unwrap();
    let tx = Bus::new(channel.connect()).unwrap();

    let filters: FilterSet = [
        CanFilter::new(0x100, 0x7F0),
        CanFilter::with_format(0x1800_0000, 0x1F00_0000, true),
    ]
    .into_iter()
    .collect();
    rx.set_filters(Some(filters)).unwrap();

    tx.send(&frame(0x10F, &[1]), None).await.unwrap();
    tx.send(&frame(0x200, &[2]), None).await.unwrap();
    tx.send(&Frame::extended(0x18FF_0001, &[3]).unwrap(), None)
        .await
        .unwrap();
    tx.send(&frame(0x1, &[0, 0, 0, 0]), None).await.unwrap();

    let first = rx.recv(WAIT).await.unwrap().unwrap();
    assert_eq!(first.arbitration_id(), 0x10F);
    let second = rx.recv(WAIT).await.unwrap().unwrap();
    assert_eq!(second.arbitration_id(), 0x18FF_0001);
    assert!(second.is_extended());
    // 0x200 is outside the filters, the keep-alive is always dropped
    assert!(rx.recv(Some(Duration::from_millis(30))).await.unwrap().is_none());

    rx.shutdown().unwrap();
    tx.shutdown().unwrap();
}

#[tokio::test]
async fn test_keep_alive_passes_without_filters() {
    let channel = VirtualChannel::new("vcan-keepalive");
    let rx = Bus::new(channel.connect()).unwrap();
    let tx = Bus::new(channel.connect()).unwrap();

    tx.send(&frame(0x1, &[0, 0, 0, 0]), None).await.unwrap();
    let received = rx.recv(WAIT).await.unwrap().unwrap();
    assert_eq!(received.arbitration_id(), 0x1);

    rx.set_filters(Some(FilterSet::from(vec![CanFilter::new(0x0, 0x0)])))
        .unwrap();
    tx.send(&frame(0x1, &[0, 0, 0, 0]), None).await.unwrap();
    tx.send(&frame(0x1, &[0, 0, 0, 1]), None).await.unwrap();
    let received = rx.recv(WAIT).await.unwrap().unwrap();
    assert_eq!(received.data(), &[0, 0, 0, 1]);

    rx.shutdown().unwrap();
    tx.shutdown().unwrap();
}

#[tokio::test]
async fn test_fd_frame_crosses_the_bus_intact() {
    let channel = VirtualChannel::new("vcan-fd");
    let rx = Bus::new(channel.connect()).unwrap();
    let tx = Bus::new(channel.connect()).unwrap();

    let payload: Vec<u8> = (0..20).collect();
    let sent = Frame::fd(0x123, &payload).unwrap();
    assert_eq!(sent.dlc(), 11);
    assert_eq!(sent.data().len(), dlc_to_length(11));
    assert!(sent.bitrate_switch());

    tx.send(&sent, None).await.unwrap();
    let received = rx.recv(WAIT).await.unwrap().unwrap();
    assert!(received.is_fd());
    assert_eq!(received.dlc(), 11);
    assert_eq!(&received.data()[..20], payload.as_slice());
    assert_eq!(received.data().len(), 20);
    assert_eq!(
        received.channel().map(ToString::to_string).as_deref(),
        Some("vcan-fd")
    );

    rx.shutdown().unwrap();
    tx.shutdown().unwrap();
}

#[tokio::test]
async fn test_recv_cyclic_fills_queue() {
    let driver = RecordingDriver::new();
    let bus = driver.open();
    let (tx, mut rx) = mpsc::channel::<Frame>(16);

    let task = bus
        .recv_cyclic(tx, Some(Duration::from_millis(20)), None)
        .unwrap();
    for id in 1..=3 {
        driver.inject(frame(id, &[]));
    }
    for id in 1..=3 {
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.arbitration_id(), id);
    }
    assert!(eventually(Duration::from_millis(200), || task.received() == 3).await);
    assert!(task.is_running());

    bus.stop_cyclic_receive();
    tokio::time::timeout(Duration::from_millis(200), task.wait())
        .await
        .unwrap();
    bus.shutdown().unwrap();
}

#[tokio::test]
async fn test_recv_cyclic_replaces_previous_task() {
    let driver = RecordingDriver::new();
    let bus = driver.open();

    let (first_tx, _first_rx) = mpsc::unbounded_channel::<Frame>();
    let first = bus.recv_cyclic(first_tx, None, None).unwrap();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel::<Frame>();
    let second = bus
        .recv_cyclic(second_tx, Some(Duration::from_millis(20)), None)
        .unwrap();

    tokio::time::timeout(Duration::from_millis(200), first.wait())
        .await
        .unwrap();
    assert!(second.is_running());

    driver.inject(frame(0x55, &[]));
    let received = tokio::time::timeout(Duration::from_secs(1), second_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.arbitration_id(), 0x55);

    bus.shutdown().unwrap();
    assert!(eventually(Duration::from_millis(200), || !second.is_running()).await);
}

#[tokio::test]
async fn test_recv_cyclic_honours_duration() {
    let driver = RecordingDriver::new();
    let bus = driver.open();
    let (tx, _rx) = mpsc::unbounded_channel::<Frame>();

    let task = bus
        .recv_cyclic(
            tx,
            Some(Duration::from_millis(10)),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), task.wait())
        .await
        .unwrap();
    assert!(!task.is_running());
    bus.shutdown().unwrap();
}
