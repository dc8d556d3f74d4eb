use crate::*;

#[tokio::test]
async fn stream_error_fails_over_to_next_node() -> Result<()> {
    let network = SimNetwork::new(&[7201, 7202]);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;
    assert_eq!(pipeline.active_port(), Some(7201));

    produce_blocks(&pipeline.buffer, 0..3)?;
    eventually("first node acked", || pipeline.buffer.highest_acked_block_number() == 2).await?;

    let first = network.node(7201);
    first.set_up(false);
    first.fail("connection reset by peer")?;

    eventually("second node active", || pipeline.active_port() == Some(7202)).await?;

    // The new stream resumes after the last acknowledged block.
    produce_blocks(&pipeline.buffer, 3..5)?;
    eventually("second node acked", || pipeline.buffer.highest_acked_block_number() == 4).await?;
    assert_eq!(network.node(7202).received(), vec![3, 4]);
    assert_eq!(first.received(), vec![0, 1, 2]);
    assert_eq!(pipeline.manager.last_verified_block(), 4);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn failover_replays_unacknowledged_blocks() -> Result<()> {
    let network = SimNetwork::new(&[7211, 7212]);
    let first = network.node(7211);
    first.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..3)?;
    eventually("blocks sent", || first.received().len() == 3).await?;
    first.respond(PublishResponse::Acknowledgement {
        block_number: 0,
        block_already_exists: false,
    })?;
    eventually("block 0 acked", || pipeline.buffer.highest_acked_block_number() == 0).await?;

    first.set_up(false);
    first.fail("broken pipe")?;

    let second = network.node(7212);
    eventually("unacked blocks replayed", || second.received() == vec![1, 2]).await?;
    eventually("replay acked", || pipeline.buffer.highest_acked_block_number() == 2).await?;

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn behind_node_is_caught_up_on_the_same_stream() -> Result<()> {
    let network = SimNetwork::new(&[7221]);
    let node = network.node(7221);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..4)?;
    eventually("blocks sent", || node.received().len() == 4).await?;

    node.respond(PublishResponse::EndOfStream {
        code: EndOfStreamCode::Behind,
        block_number: 1,
    })?;

    eventually("blocks 2 and 3 resent", || {
        node.times_received(2) == 2 && node.times_received(3) == 2
    })
    .await?;
    assert_eq!(node.times_received(0), 1);
    assert_eq!(node.times_received(1), 1);
    assert_eq!(node.connects(), 1);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn behind_node_with_no_blocks_restarts_from_zero() -> Result<()> {
    let network = SimNetwork::new(&[7231]);
    let node = network.node(7231);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..2)?;
    eventually("blocks sent", || node.received().len() == 2).await?;

    node.respond(PublishResponse::EndOfStream {
        code: EndOfStreamCode::Behind,
        block_number: NO_BLOCK,
    })?;
    eventually("resent from zero", || node.received() == vec![0, 1, 0, 1]).await?;

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn node_too_far_behind_gets_end_stream_and_reconnect() -> Result<()> {
    let network = SimNetwork::new(&[7241]);
    let node = network.node(7241);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..2)?;
    eventually("blocks sent", || node.received().len() == 2).await?;

    node.respond(PublishResponse::EndOfStream {
        code: EndOfStreamCode::Behind,
        block_number: 40,
    })?;

    eventually("end stream sent", || node.end_streams() == vec![EndStreamCode::TooFarBehind]).await?;
    eventually("reconnected", || node.connects() == 2).await?;
    eventually("new stream active", || pipeline.manager.active_connection().is_some()).await?;

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn timeout_restarts_after_last_verified_block() -> Result<()> {
    let network = SimNetwork::new(&[7251]);
    let node = network.node(7251);
    node.set_auto_ack(false);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..3)?;
    eventually("blocks sent", || node.received().len() == 3).await?;

    node.respond(PublishResponse::EndOfStream {
        code: EndOfStreamCode::Timeout,
        block_number: 0,
    })?;

    eventually("restarted at block 1", || {
        node.connects() == 2 && node.times_received(1) == 2 && node.times_received(2) == 2
    })
    .await?;
    assert_eq!(node.times_received(0), 1);

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn too_many_end_of_streams_move_to_another_node() -> Result<()> {
    let mut config = test_config();
    config.connections.max_end_of_streams_allowed = 2;
    config.connections.end_of_stream_window_secs = 60;
    config.connections.end_of_stream_schedule_delay_secs = 60;

    let network = SimNetwork::new(&[7261, 7262]);
    let first = network.node(7261);
    first.set_auto_ack(false);
    let pipeline = Pipeline::new(&config, network.clone());
    pipeline.start().await?;

    produce_blocks(&pipeline.buffer, 0..2)?;
    eventually("blocks sent", || first.received().len() == 2).await?;

    // Two end of streams are tolerated: each restarts on the same node.
    for attempt in 1..=2 {
        first.respond(PublishResponse::EndOfStream {
            code: EndOfStreamCode::Timeout,
            block_number: NO_BLOCK,
        })?;
        eventually("restart on first node", || {
            first.connects() == attempt + 1 && pipeline.active_port() == Some(7261)
        })
        .await?;
    }

    // The third trips the limit.
    first.respond(PublishResponse::EndOfStream {
        code: EndOfStreamCode::Timeout,
        block_number: NO_BLOCK,
    })?;
    eventually("second node active", || pipeline.active_port() == Some(7262)).await?;
    eventually("second node streamed", || network.node(7262).received() == vec![0, 1]).await?;
    assert_eq!(first.connects(), 3);

    pipeline.shutdown();
    Ok(())
}
