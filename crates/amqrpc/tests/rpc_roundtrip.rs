// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC round-trip integration tests
//!
//! Runs the full client stack (connection, reply router, registry, responder
//! dispatch) against the in-process [`MemoryBroker`].

use std::sync::Arc;
use std::time::Duration;

use amqrpc::{AmqpConfig, AsyncAmqpRpc, MemoryBroker, QueueBinding, Request, RpcOptions};

fn config() -> AmqpConfig {
    AmqpConfig::for_host("localhost", 5672).with_connect_attempts(1)
}

fn client_on(broker: &MemoryBroker) -> AsyncAmqpRpc {
    AsyncAmqpRpc::with_transport(config(), RpcOptions::default(), Arc::new(broker.transport()))
        .expect("Failed to build client")
}

#[tokio::test]
async fn test_call_receives_correlated_reply() {
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
        .call("svc.echo", b"hello", Duration::from_secs(5))
        .await
        .expect("Call failed");
    assert_eq!(reply, b"hello");
    assert_eq!(caller.pending_calls(), 0);

    caller.stop().await;
    responder.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    let broker = MemoryBroker::new();

    let responder = client_on(&broker);
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(QueueBinding::new("svc.upper"), |req: Request| async move {
            Some(req.payload.to_ascii_uppercase())
        })
        .await
        .expect("Failed to subscribe");

    let caller = Arc::new(client_on(&broker));
    caller.connect().await.expect("Failed to connect caller");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let caller = Arc::clone(&caller);
        tasks.push(tokio::spawn(async move {
            let payload = format!("request-{}", i);
            let reply = caller
                .call("svc.upper", payload.as_bytes(), Duration::from_secs(5))
                .await
                .expect("Call failed");
            (payload, reply)
        }));
    }

    for task in tasks {
        let (payload, reply) = task.await.expect("Call task panicked");
        assert_eq!(reply, payload.to_ascii_uppercase().into_bytes());
    }
    assert_eq!(caller.pending_calls(), 0);

    caller.stop().await;
    responder.stop().await;
}

/// The responder delays each reply by the number of milliseconds in the
/// request payload, so the first call's reply arrives last. Each caller must
/// still receive its own reply.
#[tokio::test(start_paused = true)]
async fn test_out_of_order_replies_reach_their_callers() {
    let broker = MemoryBroker::new();

    let responder = client_on(&broker);
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(QueueBinding::new("svc.delay"), |req: Request| async move {
            let ms: u64 = String::from_utf8_lossy(&req.payload)
                .parse()
                .expect("Payload is not a number");
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Some(req.payload)
        })
        .await
        .expect("Failed to subscribe");

    let caller = Arc::new(client_on(&broker));
    caller.connect().await.expect("Failed to connect caller");

    let slow = {
        let caller = Arc::clone(&caller);
        tokio::spawn(async move { caller.call("svc.delay", b"80", Duration::from_secs(5)).await })
    };
    let fast = {
        let caller = Arc::clone(&caller);
        tokio::spawn(async move { caller.call("svc.delay", b"10", Duration::from_secs(5)).await })
    };

    assert_eq!(fast.await.expect("Task panicked").expect("Fast call failed"), b"10");
    assert_eq!(slow.await.expect("Task panicked").expect("Slow call failed"), b"80");
    assert_eq!(caller.pending_calls(), 0);

    caller.stop().await;
    responder.stop().await;
}

#[tokio::test]
async fn test_single_client_serves_and_calls() {
    let broker = MemoryBroker::new();

    let rpc = client_on(&broker);
    rpc.connect().await.expect("Failed to connect");
    rpc.subscribe(QueueBinding::new("svc.reverse"), |req: Request| async move {
        let mut bytes = req.payload;
        bytes.reverse();
        Some(bytes)
    })
    .await
    .expect("Failed to subscribe");

    let reply = rpc
        .call("svc.reverse", b"abcdef", Duration::from_secs(5))
        .await
        .expect("Call failed");
    assert_eq!(reply, b"fedcba");

    rpc.stop().await;
}

#[tokio::test]
async fn test_replies_route_through_callback_exchange() {
    let broker = MemoryBroker::new();

    let responder = AsyncAmqpRpc::with_transport(
        config(),
        RpcOptions::default().with_reply_exchange("callbacks"),
        Arc::new(broker.transport()),
    )
    .expect("Failed to build responder");
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(QueueBinding::new("svc.echo"), |req: Request| async move {
            Some(req.payload)
        })
        .await
        .expect("Failed to subscribe");

    let caller = AsyncAmqpRpc::with_transport(
        config(),
        RpcOptions::default().with_callback_exchange("callbacks"),
        Arc::new(broker.transport()),
    )
    .expect("Failed to build caller");
    caller.connect().await.expect("Failed to connect caller");

    let reply = caller
        .call("svc.echo", b"via exchange", Duration::from_secs(5))
        .await
        .expect("Call failed");
    assert_eq!(reply, b"via exchange");

    caller.stop().await;
    responder.stop().await;
}

#[tokio::test]
async fn test_cast_is_consumed_without_a_reply() {
    let broker = MemoryBroker::new();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);

    let responder = client_on(&broker);
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(QueueBinding::new("svc.audit"), move |req: Request| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send(req.payload).await.expect("Failed to record");
                None::<Vec<u8>>
            }
        })
        .await
        .expect("Failed to subscribe");

    let caster = client_on(&broker);
    caster.connect().await.expect("Failed to connect caster");
    caster.cast("svc.audit", b"event-1").await.expect("Cast failed");

    let seen = seen_rx.recv().await.expect("Handler never saw the cast");
    assert_eq!(seen, b"event-1");
    assert_eq!(caster.pending_calls(), 0);

    caster.stop().await;
    responder.stop().await;
}

#[tokio::test]
async fn test_bound_exchange_requests_reach_the_responder() {
    let broker = MemoryBroker::new();

    let responder = client_on(&broker);
    responder.connect().await.expect("Failed to connect responder");
    responder
        .subscribe(
            QueueBinding::new("svc.math").with_exchange("rpc").with_routing_key("math.add"),
            |req: Request| async move {
                assert_eq!(req.routing_key, "math.add");
                Some(b"4".to_vec())
            },
        )
        .await
        .expect("Failed to subscribe");

    let caller = client_on(&broker);
    caller.connect().await.expect("Failed to connect caller");

    let reply = caller
        .call_exchange("rpc", "math.add", b"[2, 2]", Duration::from_secs(5))
        .await
        .expect("Call failed");
    assert_eq!(reply, b"4");

    caller.stop().await;
    responder.stop().await;
}
