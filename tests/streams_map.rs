use qmux::{
    Config, QmuxError, Role, Stream, StreamFactory, StreamsMap, ConnectionFlowControl,
    StreamFlowControl, CRYPTO_STREAM_ID, HEADERS_STREAM_ID,
};
use std::sync::Arc;
use std::time::Duration;

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

fn new_map(role: Role, config: Config) -> Arc<StreamsMap> {
    let connection = Arc::new(ConnectionFlowControl::new(&config));
    let factory_config = config.clone();
    let factory: StreamFactory = Box::new(move |id| {
        let contributes = id != CRYPTO_STREAM_ID && id != HEADERS_STREAM_ID;
        Arc::new(Stream::new(
            id,
            StreamFlowControl::new(id, &factory_config, Arc::clone(&connection), contributes),
        ))
    });
    Arc::new(StreamsMap::new(role, config, factory))
}

fn retire(map: &StreamsMap, stream: &Arc<Stream>) -> Result<(), QmuxError> {
    stream.cancel();
    map.delete_closed_streams()
}

test_with_timeout!(test_accept_blocks_until_stream_opens, 10, {
    let map = new_map(Role::Server, Config::default());

    let acceptor = {
        let map = Arc::clone(&map);
        tokio::spawn(async move { map.accept_stream().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!acceptor.is_finished());

    map.get_or_open_stream(1)?;
    let stream = acceptor.await??;
    assert_eq!(stream.id(), 1);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_accept_unblocks_on_close, 10, {
    let map = new_map(Role::Server, Config::default());
    let test_err = QmuxError::Closed("connection torn down".to_string());

    let acceptor = {
        let map = Arc::clone(&map);
        tokio::spawn(async move { map.accept_stream().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    map.close_with_error(test_err.clone());
    assert_eq!(acceptor.await?.unwrap_err(), test_err);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_concurrent_acceptors_get_distinct_streams, 10, {
    let map = new_map(Role::Server, Config::default());

    let mut acceptors = Vec::new();
    for _ in 0..5 {
        let map = Arc::clone(&map);
        acceptors.push(tokio::spawn(async move { map.accept_stream().await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One incoming frame implicitly opens streams 1 through 9
    map.get_or_open_stream(9)?;

    let mut ids = Vec::new();
    for accepted in futures::future::join_all(acceptors).await {
        ids.push(accepted??.id());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3, 5, 7, 9]);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_open_stream_sync_returns_immediately_with_capacity, 10, {
    let map = new_map(Role::Server, Config::default());
    map.update_transport_parameters(10);

    let stream = map.open_stream_sync().await?;
    assert_eq!(stream.id(), 2);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_open_stream_sync_waits_for_capacity, 10, {
    let map = new_map(Role::Server, Config::default());
    map.update_transport_parameters(1);
    let first = map.open_stream()?;
    assert_eq!(first.id(), 2);

    let opener = {
        let map = Arc::clone(&map);
        tokio::spawn(async move { map.open_stream_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!opener.is_finished());

    // Retiring the only open stream frees a slot
    retire(&map, &first)?;
    let stream = opener.await??;
    assert_eq!(stream.id(), 4);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_open_stream_sync_serves_waiters_in_fifo_order, 10, {
    let map = new_map(Role::Server, Config::default());
    map.update_transport_parameters(1);
    let first = map.open_stream()?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut waiters = Vec::new();
    for label in ["a", "b", "c"] {
        let map = Arc::clone(&map);
        let tx = tx.clone();
        waiters.push(tokio::spawn(async move {
            let stream = map.open_stream_sync().await?;
            tx.send((label, stream.id())).unwrap();
            Ok::<Arc<Stream>, QmuxError>(stream)
        }));
        // Let the waiter park before spawning the next one
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Free one slot at a time; each wakes exactly the earliest waiter
    retire(&map, &first)?;
    let (label, id) = rx.recv().await.unwrap();
    assert_eq!((label, id), ("a", 4));

    let second = waiters.remove(0).await??;
    retire(&map, &second)?;
    let (label, id) = rx.recv().await.unwrap();
    assert_eq!((label, id), ("b", 6));

    let third = waiters.remove(0).await??;
    retire(&map, &third)?;
    let (label, id) = rx.recv().await.unwrap();
    assert_eq!((label, id), ("c", 8));

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_open_stream_sync_unblocks_on_transport_parameters, 10, {
    let map = new_map(Role::Client, Config::default());

    // Limit still unknown: the opener has to wait for negotiation
    let opener = {
        let map = Arc::clone(&map);
        tokio::spawn(async move { map.open_stream_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!opener.is_finished());

    map.update_transport_parameters(1);
    let stream = opener.await??;
    assert_eq!(stream.id(), 1);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_close_fans_out_to_every_waiter, 10, {
    let map = new_map(Role::Server, Config::default());
    let test_err = QmuxError::Closed("fatal".to_string());

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let map = Arc::clone(&map);
        waiters.push(tokio::spawn(async move { map.accept_stream().await }));
    }
    for _ in 0..2 {
        let map = Arc::clone(&map);
        waiters.push(tokio::spawn(async move { map.open_stream_sync().await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    map.close_with_error(test_err.clone());
    for waiter in waiters {
        assert_eq!(waiter.await?.unwrap_err(), test_err);
    }
    // Later calls observe the same error
    assert_eq!(map.open_stream().unwrap_err(), test_err);
    assert_eq!(map.get_or_open_stream(1).unwrap_err(), test_err);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_retired_streams_tolerate_late_frames, 10, {
    let map = new_map(Role::Server, Config::default());

    map.get_or_open_stream(5)?;
    for _ in 0..3 {
        let stream = map.accept_stream().await?;
        stream.cancel();
    }
    map.delete_closed_streams()?;
    assert!(map.is_empty());

    // Late frames for reclaimed streams are dropped, not errors
    assert!(map.get_or_open_stream(1)?.is_none());
    assert!(map.get_or_open_stream(5)?.is_none());
    // Higher IDs still open fresh streams
    assert!(map.get_or_open_stream(7)?.is_some());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_abandoned_opener_does_not_starve_later_waiters, 10, {
    let map = new_map(Role::Server, Config::default());
    map.update_transport_parameters(1);
    let first = map.open_stream()?;

    let abandoned = {
        let map = Arc::clone(&map);
        tokio::spawn(async move { map.open_stream_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    abandoned.abort();
    let _ = abandoned.await;

    let opener = {
        let map = Arc::clone(&map);
        tokio::spawn(async move { map.open_stream_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    retire(&map, &first)?;
    let stream = opener.await??;
    assert_eq!(stream.id(), 4);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_priority_streams_lead_scheduler_passes, 10, {
    use bytes::Bytes;

    let map = new_map(Role::Server, Config::default());
    map.get_or_open_stream(7)?; // opens 1, 3, 5, 7

    for id in [HEADERS_STREAM_ID, 5, 7, CRYPTO_STREAM_ID] {
        let stream = map
            .get_or_open_stream(id)?
            .ok_or("stream disappeared")?;
        stream.update_send_window(1024);
        stream.write(Bytes::from(format!("data from {id}")))?;
    }

    let mut order = Vec::new();
    map.round_robin_iterate(|stream| {
        if stream.pop_send_data(1024)?.is_some() {
            order.push(stream.id());
        }
        Ok(true)
    })?;
    assert_eq!(&order[..2], &[CRYPTO_STREAM_ID, HEADERS_STREAM_ID]);
    assert_eq!(&order[2..], &[5, 7]);

    Ok::<(), Box<dyn std::error::Error>>(())
});
