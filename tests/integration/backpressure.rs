use crate::*;

use blockstream_core::config::StreamMode;

/// Ideal buffer of five blocks: 10s TTL over a 2s block period.
fn small_buffer_config() -> BlockStreamConfig {
    let mut config = test_config();
    config.stream.block_period_ms = 2_000;
    config.buffer.block_ttl_secs = 10;
    config.buffer.action_stage_threshold = 50.0;
    config.buffer.recovery_threshold = 70.0;
    config
}

fn ack(block_number: u64) -> PublishResponse {
    PublishResponse::Acknowledgement {
        block_number,
        block_already_exists: false,
    }
}

#[tokio::test]
async fn saturated_buffer_holds_producer_until_acks_drain_it() -> Result<()> {
    let network = SimNetwork::new(&[7401]);
    let node = network.node(7401);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&small_buffer_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..5)?;
    eventually("blocks sent", || node.received().len() == 5).await?;

    let result = pipeline.buffer.check_buffer();
    assert_eq!(result.ideal_max_buffer_size, 5);
    assert!(result.is_saturated);
    assert!(pipeline.buffer.is_backpressure_engaged());

    let waiter = {
        let buffer = pipeline.buffer.clone();
        tokio::spawn(async move { buffer.ensure_new_blocks_permitted().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "producer should be held");

    node.respond(ack(3))?;
    eventually("block 3 acked", || pipeline.buffer.highest_acked_block_number() == 3).await?;

    let result = pipeline.buffer.check_buffer();
    assert_eq!(result.pending_ack, 1);
    assert_eq!(result.saturation_percent, 20.0);
    assert!(!pipeline.buffer.is_backpressure_engaged());
    tokio::time::timeout(WAIT, waiter).await??;

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn backpressure_holds_until_recovery_threshold() -> Result<()> {
    let network = SimNetwork::new(&[7411]);
    let node = network.node(7411);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&small_buffer_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..5)?;
    eventually("blocks sent", || node.received().len() == 5).await?;
    pipeline.buffer.check_buffer();
    assert!(pipeline.buffer.is_backpressure_engaged());

    // 80% is no longer saturated but still above recovery.
    node.respond(ack(0))?;
    eventually("block 0 acked", || pipeline.buffer.highest_acked_block_number() == 0).await?;
    let result = pipeline.buffer.check_buffer();
    assert_eq!(result.saturation_percent, 80.0);
    assert!(pipeline.buffer.is_backpressure_engaged());

    // 60% is at or below recovery.
    node.respond(ack(1))?;
    eventually("block 1 acked", || pipeline.buffer.highest_acked_block_number() == 1).await?;
    let result = pipeline.buffer.check_buffer();
    assert_eq!(result.saturation_percent, 60.0);
    assert!(!pipeline.buffer.is_backpressure_engaged());

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn mixed_stream_mode_never_applies_backpressure() -> Result<()> {
    let mut config = small_buffer_config();
    config.stream.stream_mode = StreamMode::Both;
    let network = SimNetwork::new(&[7421]);
    let node = network.node(7421);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&config, network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..6)?;
    eventually("blocks sent", || node.received().len() == 6).await?;

    let result = pipeline.buffer.check_buffer();
    assert!(result.is_saturated);
    assert!(!pipeline.buffer.is_backpressure_engaged());
    tokio::time::timeout(WAIT, pipeline.buffer.ensure_new_blocks_permitted()).await?;

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn producer_keeps_pace_with_acknowledging_node() -> Result<()> {
    let network = SimNetwork::new(&[7431]);
    let pipeline = Pipeline::new(&small_buffer_config(), network.clone());
    pipeline.start().await?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let prune = tokio::spawn(pipeline.buffer.clone().run_prune_loop(shutdown_tx.subscribe()));

    let producer = {
        let buffer = pipeline.buffer.clone();
        tokio::spawn(async move {
            for block in 0..20 {
                buffer.ensure_new_blocks_permitted().await;
                produce_block(&buffer, block, 4)?;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    tokio::time::timeout(WAIT, producer).await???;
    eventually("all blocks acked", || pipeline.buffer.highest_acked_block_number() == 19).await?;
    eventually("buffer drained", || pipeline.buffer.buffered_block_count() == 0).await?;
    assert!(!pipeline.buffer.is_backpressure_engaged());
    assert_eq!(network.node(7431).received(), (0..20).collect::<Vec<u64>>());

    let _ = shutdown_tx.send(());
    prune.await??;
    pipeline.shutdown();
    Ok(())
}
