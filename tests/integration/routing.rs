use anyhow::{ensure, Result};
use bytes::Bytes;
use rand::Rng;

use crate::*;

#[tokio::test]
async fn test_inbound_sms_reaches_registered_app() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;

    let outcome = alpha.client.register(5120).await;
    ensure!(outcome.app_reached(), "registration failed: {outcome:?}");

    let mut payload = [0u8; 32];
    rand::thread_rng().fill(&mut payload[..]);
    let delivered = device
        .relay
        .on_frame_received(PHONE, 5120, Bytes::copy_from_slice(&payload))
        .await;
    assert_eq!(delivered, 1);

    assert_eq!(alpha.received(), [(5120, PHONE.to_string(), payload.to_vec())]);

    let rollup = device.relay.ledger().query_port(5120).await;
    assert_eq!(rollup.current_hour.count_received, 1);
    assert_eq!(rollup.current_hour.bytes_received, 32);
    assert_eq!(rollup.app_name.as_deref(), Some("alpha"));
    Ok(())
}

#[tokio::test]
async fn test_fan_out_isolates_failing_app() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    let beta = device.install_app("com.example.beta")?;
    ensure!(alpha.client.register(5120).await.app_reached());
    ensure!(beta.client.register(5120).await.app_reached());

    device.router.break_app("com.example.alpha");
    let delivered = device
        .relay
        .on_frame_received(PHONE, 5120, Bytes::from_static(b"both of you"))
        .await;

    assert_eq!(delivered, 1);
    assert!(alpha.received().is_empty());
    assert_eq!(beta.received().len(), 1);
    assert_eq!(beta.received()[0].2, b"both of you");
    Ok(())
}

#[tokio::test]
async fn test_unregistered_port_is_not_an_error() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    ensure!(alpha.client.register(5120).await.app_reached());

    let delivered = device
        .relay
        .on_frame_received(PHONE, 6001, Bytes::from_static(b"nobody"))
        .await;

    assert_eq!(delivered, 0);
    assert!(alpha.received().is_empty());
    assert_eq!(device.raised.all(), ["no_registered_recipient:6001"]);
    Ok(())
}

#[tokio::test]
async fn test_unregister_stops_delivery() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    ensure!(alpha.client.register(5120).await.app_reached());

    assert!(device.relay.registry().unregister(5120, "com.example.alpha").await);
    let delivered = device
        .relay
        .on_frame_received(PHONE, 5120, Bytes::from_static(b"late"))
        .await;
    assert_eq!(delivered, 0);
    assert!(alpha.received().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_announcements_reach_clients() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    ensure!(alpha.client.register(5120).await.app_reached());

    assert_eq!(device.relay.announce_app_launched().await, 1);
    assert_eq!(device.relay.announce_permissions_granted().await, 1);
    assert!(alpha.inbox.launched.load(Ordering::SeqCst));
    assert!(alpha.inbox.granted.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_tracked_send_completes_on_echo() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    ensure!(alpha.client.register(5120).await.app_reached());

    // Sending to our own number: the carrier output comes straight back in.
    let echo = alpha.client.send_tracked(PHONE, 5120, b"loopback")?;
    let carrier = &device.carrier;
    eventually("carrier submission", || async move {
        !carrier.outbox.lock().unwrap().is_empty()
    })
    .await?;
    let (to, port, data) = device.carrier.outbox.lock().unwrap()[0].clone();
    device
        .relay
        .on_frame_received(&to, port, Bytes::from(data))
        .await;

    tokio::time::timeout(Duration::from_secs(2), echo).await??;
    assert!(alpha.client.pending().is_empty());
    Ok(())
}
