use anyhow::{ensure, Result};
use bytes::Bytes;

use crate::*;

#[tokio::test]
async fn test_two_sends_merge_into_current_hour() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    ensure!(alpha.client.register(5120).await.app_reached());

    alpha.client.send(PHONE, 5120, &[1u8; 10])?;
    alpha.client.send(PHONE, 5120, &[2u8; 20])?;

    let relay = &device.relay;
    eventually("both sends acknowledged", || async move {
        relay.tracker().get(5120).delivered == 2
            && relay.ledger().query_port(5120).await.current_hour.count_sent == 2
    })
    .await?;
    let ledger = relay.ledger();

    let rollup = ledger.query_port(5120).await;
    assert_eq!(rollup.current_hour.bytes_sent, 30);
    assert_eq!(rollup.current_hour.count_received, 0);
    assert_eq!(device.carrier.outbox.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_quiet_port_rolls_up_to_zero() -> Result<()> {
    let device = Device::new()?;
    let rollup = device.relay.ledger().query_port(4242).await;
    assert!(rollup.current_hour.is_empty());
    assert!(rollup.trailing_week.is_empty());
    assert!(rollup.all_time.is_empty());
    assert_eq!(rollup.app_name, None);
    Ok(())
}

#[tokio::test]
async fn test_windows_nest_and_survive_compaction() -> Result<()> {
    let device = Device::new()?;
    let alpha = device.install_app("com.example.alpha")?;
    ensure!(alpha.client.register(5120).await.app_reached());

    let now = nbsp_core::now_hour();
    let ledger = device.relay.ledger();
    ledger.record_at(false, 5120, 100, now - 400);
    ledger.record_at(false, 5120, 50, now - 30);
    device
        .relay
        .on_frame_received(PHONE, 5120, Bytes::from_static(b"12345"))
        .await;

    let before = ledger.query_port_at(5120, now).await;
    assert!(before.all_time.bytes_received >= before.trailing_week.bytes_received);
    assert!(before.trailing_week.bytes_received >= before.current_hour.bytes_received);
    assert_eq!(before.all_time.bytes_received, 155);
    assert_eq!(before.trailing_week.bytes_received, 55);
    assert_eq!(before.current_hour.bytes_received, 5);

    assert_eq!(ledger.compact_at(24, now).await?, 2);
    let after = ledger.query_port_at(5120, now).await;
    assert_eq!(after.all_time, before.all_time);
    assert_eq!(after.current_hour, before.current_hour);
    assert_eq!(after.trailing_week.bytes_received, 5);

    device.packages.uninstall("com.example.alpha");
    assert_eq!(ledger.query_port_at(5120, now).await.app_name, None);
    Ok(())
}
