use std::time::Duration;

use anyhow::Result;

use super::Debouncer;

#[tokio::test]
async fn it_coalesces_bursts_into_one_tick() -> Result<()> {
    let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(20));

    for _ in 0..5 {
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rx.try_recv().is_err());

    return Ok(());
}

#[tokio::test]
async fn it_fires_again_after_a_quiet_window() -> Result<()> {
    let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(5));

    debouncer.trigger();
    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    debouncer.trigger();
    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;

    return Ok(());
}

#[tokio::test]
async fn it_drops_cancelled_ticks() -> Result<()> {
    let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(10));

    debouncer.trigger();
    debouncer.cancel();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(rx.try_recv().is_err());

    return Ok(());
}
