use crate::*;

#[tokio::test]
async fn produced_blocks_are_streamed_in_order_and_acknowledged() -> Result<()> {
    let network = SimNetwork::new(&[7101]);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..5)?;

    eventually("all blocks acked", || pipeline.buffer.highest_acked_block_number() == 4).await?;
    assert_eq!(network.node(7101).received(), vec![0, 1, 2, 3, 4]);
    assert_eq!(pipeline.manager.last_verified_block(), 4);
    assert_eq!(
        pipeline.manager.last_verified_block_for(&network.node(7101).config(1)),
        4
    );

    // Acked and closed blocks leave the buffer.
    let result = pipeline.buffer.check_buffer();
    assert_eq!(result.pending_ack, 0);
    assert_eq!(pipeline.buffer.buffered_block_count(), 0);
    assert_eq!(pipeline.buffer.earliest_available_block_number(), -1);
    println!("prune: {:?}", result);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn blocks_produced_before_connecting_are_streamed_from_the_earliest() -> Result<()> {
    let network = SimNetwork::new(&[7111]);
    let pipeline = Pipeline::new(&test_config(), network.clone());

    produce_blocks(&pipeline.buffer, 10..13)?;
    pipeline.start().await?;

    eventually("backlog acked", || pipeline.buffer.highest_acked_block_number() == 12).await?;
    assert_eq!(network.node(7111).received(), vec![10, 11, 12]);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn streaming_waits_for_the_next_block() -> Result<()> {
    let network = SimNetwork::new(&[7121]);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..2)?;
    eventually("first blocks acked", || pipeline.buffer.highest_acked_block_number() == 1).await?;

    // Nothing new: the connection idles on block 2.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pipeline.manager.current_streaming_block_number(), 2);

    produce_blocks(&pipeline.buffer, 2..4)?;
    eventually("later blocks acked", || pipeline.buffer.highest_acked_block_number() == 3).await?;
    assert_eq!(network.node(7121).received(), vec![0, 1, 2, 3]);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn reopened_acknowledged_block_is_pruned_without_resending() -> Result<()> {
    let network = SimNetwork::new(&[7131]);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..3)?;
    eventually("blocks acked", || pipeline.buffer.highest_acked_block_number() == 2).await?;

    produce_block(&pipeline.buffer, 1, 1)?;
    assert!(pipeline.buffer.is_acked(1));

    let result = pipeline.buffer.check_buffer();
    assert_eq!(result.pruned, 1);
    assert_eq!(result.pending_ack, 0);
    assert!(pipeline.buffer.get_block_state(1).is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(network.node(7131).received(), vec![0, 1, 2]);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn reopening_a_block_after_its_proof_was_sent_is_refused() -> Result<()> {
    let network = SimNetwork::new(&[7136]);
    let node = network.node(7136);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..2)?;
    eventually("proof of block 1 sent", || {
        pipeline.buffer.get_block_state(1).is_some_and(|u| u.proof_sent())
    })
    .await?;

    let err = pipeline.buffer.open_block(1).unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {err}");
    assert!(pipeline.buffer.open_block(2).is_ok());

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn skip_block_moves_past_a_block_the_node_already_has() -> Result<()> {
    let network = SimNetwork::new(&[7141]);
    let node = network.node(7141);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    // Block 0 is still open, so the connection is parked on it.
    pipeline.buffer.open_block(0)?;
    pipeline
        .buffer
        .add_item(0, BlockItem::new(ItemKind::BlockHeader, vec![0u8; 8]))?;
    eventually("streaming block 0", || pipeline.manager.current_streaming_block_number() == 0).await?;

    node.respond(PublishResponse::SkipBlock { block_number: 0 })?;
    eventually("moved to block 1", || pipeline.manager.current_streaming_block_number() == 1).await?;

    produce_block(&pipeline.buffer, 1, 2)?;
    eventually("block 1 sent", || node.received() == vec![1]).await?;

    pipeline.shutdown();
    Ok(())
}
