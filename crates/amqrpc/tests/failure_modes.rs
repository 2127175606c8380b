// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Failure-mode integration tests
//!
//! Timeouts, connection loss, shutdown and candidate failover, driven through
//! the [`MemoryBroker`] fault hooks.

use std::sync::Arc;
use std::time::Duration;

use amqrpc::{
    AmqpConfig, AsyncAmqpRpc, ClientState, Error, MemoryBroker, QueueBinding, Request, RpcOptions,
};

fn config() -> AmqpConfig {
    AmqpConfig::for_host("localhost", 5672)
        .with_connect_attempts(1)
        .with_retry_delay(Duration::from_millis(10))
}

fn client_on(broker: &MemoryBroker) -> AsyncAmqpRpc {
    AsyncAmqpRpc::with_transport(config(), RpcOptions::default(), Arc::new(broker.transport()))
        .expect("Failed to build client")
}

/// Poll `condition` every few milliseconds until it holds or a deadline
/// passes. The broker hooks act on background tasks, so state transitions
/// are observed, not awaited.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Condition not reached within 2s");
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_when_no_responder() {
    let broker = MemoryBroker::new();
    let caller = client_on(&broker);
    caller.connect().await.expect("Failed to connect");

    let err = caller
        .call("svc.void", b"anyone?", Duration::from_millis(50))
        .await
        .expect_err("Call should have timed out");
    assert_eq!(err, Error::Timeout);

    // The timed-out call must leave no registry entry behind.
    assert_eq!(caller.pending_calls(), 0);
    assert_eq!(caller.state(), ClientState::Connected);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_is_discarded() {
    let broker = MemoryBroker::new();

    // Replies after the number of milliseconds given in the payload.
    let responder = client_on(&broker);
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(QueueBinding::new("svc.slow"), |req: Request| async move {
            let ms: u64 = String::from_utf8_lossy(&req.payload)
                .parse()
                .expect("Payload is not a number");
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Some(req.payload)
        })
        .await
        .expect("Failed to subscribe");

    let caller = client_on(&broker);
    caller.connect().await.expect("Failed to connect caller");

    let err = caller
        .call("svc.slow", b"100", Duration::from_millis(30))
        .await
        .expect_err("Call should have timed out");
    assert_eq!(err, Error::Timeout);
    assert_eq!(caller.pending_calls(), 0);

    // Let the late reply arrive; the router discards it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The client is unharmed and fresh calls still correlate correctly.
    let reply = caller
        .call("svc.slow", b"0", Duration::from_secs(5))
        .await
        .expect("Follow-up call failed");
    assert_eq!(reply, b"0");
    assert_eq!(caller.pending_calls(), 0);

    caller.stop().await;
    responder.stop().await;
}

#[tokio::test]
async fn test_connection_loss_fails_pending_calls() {
    let broker = MemoryBroker::new();
    let caller = Arc::new(client_on(&broker));
    caller.connect().await.expect("Failed to connect");

    let task = {
        let caller = Arc::clone(&caller);
        tokio::spawn(async move { caller.call("svc.void", b"ping", Duration::from_secs(30)).await })
    };
    wait_for(|| caller.pending_calls() == 1).await;

    broker.sever();

    let err = task
        .await
        .expect("Call task panicked")
        .expect_err("Call should have failed");
    assert!(matches!(err, Error::ServiceUnavailable(_)), "got {:?}", err);
    assert!(err.is_connectivity());

    assert_eq!(caller.state(), ClientState::Disconnected);
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test]
async fn test_cast_publish_failure_reports_service_unavailable() {
    let broker = MemoryBroker::new();
    let caller = client_on(&broker);
    caller.connect().await.expect("Failed to connect");

    // Kill the link under the client; the next publish fails before the
    // router has observed the loss.
    broker.sever();

    let err = caller
        .cast("svc.fire", b"dropped")
        .await
        .expect_err("Cast should have failed");
    assert!(matches!(err, Error::ServiceUnavailable(_)), "got {:?}", err);
    assert!(err.is_connectivity());

    caller.stop().await;
}

#[tokio::test]
async fn test_stop_fails_pending_calls_with_shutdown() {
    let broker = MemoryBroker::new();
    let caller = Arc::new(client_on(&broker));
    caller.connect().await.expect("Failed to connect");

    let mut tasks = Vec::new();
    for i in 0..3 {
        let caller = Arc::clone(&caller);
        tasks.push(tokio::spawn(async move {
            let payload = format!("ping-{}", i);
            caller
                .call("svc.void", payload.as_bytes(), Duration::from_secs(30))
                .await
        }));
    }
    wait_for(|| caller.pending_calls() == 3).await;

    caller.stop().await;

    for task in tasks {
        let err = task
            .await
            .expect("Call task panicked")
            .expect_err("Call should have failed");
        assert_eq!(err, Error::Shutdown);
    }
    assert_eq!(caller.state(), ClientState::Stopped);
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test]
async fn test_reconnect_after_connection_loss() {
    let broker = MemoryBroker::new();

    let responder = client_on(&broker);
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(QueueBinding::new("svc.echo"), |req: Request| async move {
            Some(req.payload)
        })
        .await
        .expect("Failed to subscribe");

    let caller = client_on(&broker);
    caller.connect().await.expect("Failed to connect caller");
    let reply = caller
        .call("svc.echo", b"first", Duration::from_secs(5))
        .await
        .expect("Call failed");
    assert_eq!(reply, b"first");

    broker.sever();
    wait_for(|| caller.state() == ClientState::Disconnected).await;
    wait_for(|| responder.state() == ClientState::Disconnected).await;

    // Subscriptions die with the session; reconnect and subscribe anew.
    responder.connect().await.expect("Failed to reconnect responder");
    responder
        .subscribe(QueueBinding::new("svc.echo"), |req: Request| async move {
            Some(req.payload)
        })
        .await
        .expect("Failed to resubscribe");

    caller.connect().await.expect("Failed to reconnect caller");
    let reply = caller
        .call("svc.echo", b"second", Duration::from_secs(5))
        .await
        .expect("Call after reconnect failed");
    assert_eq!(reply, b"second");

    caller.stop().await;
    responder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_exhausts_candidates_and_reports_failure() {
    let broker = MemoryBroker::new();
    broker.set_down(true);

    let caller = AsyncAmqpRpc::with_transport(
        config().with_connect_attempts(2),
        RpcOptions::default(),
        Arc::new(broker.transport()),
    )
    .expect("Failed to build client");

    let err = caller.connect().await.expect_err("Connect should have failed");
    assert!(matches!(err, Error::ConnectionFailed(_)), "got {:?}", err);
    assert_eq!(caller.state(), ClientState::Disconnected);

    // A later attempt against a healthy broker succeeds.
    broker.set_down(false);
    caller.connect().await.expect("Failed to connect");
    assert_eq!(caller.state(), ClientState::Connected);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_failing_connect_leaves_client_stopped() {
    let broker = MemoryBroker::new();
    broker.set_down(true);

    let caller = Arc::new(
        AsyncAmqpRpc::with_transport(
            config()
                .with_connect_attempts(4)
                .with_retry_delay(Duration::from_millis(60)),
            RpcOptions::default(),
            Arc::new(broker.transport()),
        )
        .expect("Failed to build client"),
    );

    let connecting = {
        let caller = Arc::clone(&caller);
        tokio::spawn(async move { caller.connect().await })
    };
    wait_for(|| caller.state() == ClientState::Connecting).await;

    // Stop while the retry loop sits in a backoff.
    caller.stop().await;
    assert_eq!(caller.state(), ClientState::Stopped);

    let result = connecting.await.expect("Connect task panicked");
    assert_eq!(
        result.expect_err("Connect should have been cut short"),
        Error::Shutdown
    );

    // Stopped is terminal; the raced connect must leave it that way.
    assert_eq!(caller.state(), ClientState::Stopped);
    let err = caller.connect().await.expect_err("Connect should be rejected");
    assert!(matches!(err, Error::InvalidState(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_connect_falls_back_to_surviving_host() {
    let broker = MemoryBroker::new();
    broker.fail_host("rabbit-1");

    let caller = AsyncAmqpRpc::with_transport(
        AmqpConfig::new(vec![
            ("rabbit-1".to_string(), 5672),
            ("rabbit-2".to_string(), 5672),
        ])
        .with_connect_attempts(1),
        RpcOptions::default(),
        Arc::new(broker.transport()),
    )
    .expect("Failed to build client");

    caller.connect().await.expect("Failed to connect");
    assert_eq!(caller.state(), ClientState::Connected);
    assert!(caller.reply_queue().is_some());

    caller.stop().await;
}

#[tokio::test]
async fn test_call_before_connect_is_rejected() {
    let broker = MemoryBroker::new();
    let caller = client_on(&broker);

    let err = caller
        .call("svc.echo", b"early", Duration::from_secs(1))
        .await
        .expect_err("Call should have been rejected");
    assert!(matches!(err, Error::InvalidState(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_dropped_client_releases_its_link() {
    let broker = MemoryBroker::new();
    let caller = client_on(&broker);
    caller.connect().await.expect("Failed to connect");
    assert_eq!(broker.open_links(), 1);

    // No stop(); dropping the client must still close the link so the
    // transport consumer tasks wind down.
    drop(caller);
    wait_for(|| broker.open_links() == 0).await;
}
