//! Delivery executor tests against a mock backend and the in-memory broker.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use relay_broker::{
    mock::{ChannelOp, MockChannel, PublishedMessage},
    QueueTopology,
};
use relay_core::{ApiTarget, DeliveryTag, Envelope, PendingMessage, RealClock};
use relay_delivery::{
    DeliveryExecutor, DeliveryOutcome, ForwardClient, RetryLadder, WakeCoordinator, WakeSettings,
};
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn message(tag: u64, attempt: u32, body: serde_json::Value) -> PendingMessage {
    let raw = Bytes::from(body.to_string());
    Envelope::parse(&raw).unwrap().into_pending(DeliveryTag(tag), raw, attempt)
}

fn executor(
    channel: &Arc<MockChannel>,
    target: ApiTarget,
    max_attempts: u32,
    cancel: CancellationToken,
) -> DeliveryExecutor {
    DeliveryExecutor::new(
        ForwardClient::with_defaults().unwrap(),
        channel.clone(),
        target,
        QueueTopology::new("sdr_queue", Duration::from_secs(10)),
        RetryLadder::new(max_attempts),
        cancel,
    )
}

fn local(server: &MockServer) -> ApiTarget {
    ApiTarget::Local { base_url: server.uri() }
}

#[tokio::test]
async fn put_is_forwarded_with_routing_fields_stripped() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("PUT"))
        .and(matchers::path("/x"))
        .and(matchers::body_json(json!({"a": 1})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let channel = Arc::new(MockChannel::new());
    let executor = executor(&channel, local(&server), 5, CancellationToken::new());

    let outcome = executor
        .deliver(message(1, 1, json!({"httpRequest": "PUT", "urlSuffix": "/x", "a": 1})))
        .await;

    assert_eq!(outcome, DeliveryOutcome::Delivered);
    assert_eq!(channel.ops().await, vec![ChannelOp::Ack(DeliveryTag(1))]);
}

#[tokio::test]
async fn non_put_methods_are_posted() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/devices"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let channel = Arc::new(MockChannel::new());
    let executor = executor(&channel, local(&server), 5, CancellationToken::new());

    let outcome = executor
        .deliver(message(4, 1, json!({"httpRequest": "delete", "urlSuffix": "/devices"})))
        .await;

    assert_eq!(outcome, DeliveryOutcome::Delivered);
}

#[tokio::test]
async fn failure_with_attempts_left_is_republished_to_retry_then_acked() {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(503)).mount(&server).await;

    let channel = Arc::new(MockChannel::new());
    let executor = executor(&channel, local(&server), 5, CancellationToken::new());
    let pending = message(7, 2, json!({"httpRequest": "POST", "urlSuffix": "/x", "a": 1}));
    let raw_body = pending.raw_body.clone();

    let outcome = executor.deliver(pending).await;

    assert_eq!(outcome, DeliveryOutcome::RetryScheduled { next_attempt: 3 });
    assert_eq!(channel.ops().await, vec![
        ChannelOp::Published(PublishedMessage {
            queue: "sdr_queue.retry".to_string(),
            body: raw_body,
            attempt: 3,
        }),
        ChannelOp::Ack(DeliveryTag(7)),
    ]);
}

#[tokio::test]
async fn exhausted_attempts_go_to_failed_queue_unchanged() {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let channel = Arc::new(MockChannel::new());
    let executor = executor(&channel, local(&server), 3, CancellationToken::new());

    let outcome = executor
        .deliver(message(9, 3, json!({"httpRequest": "PUT", "urlSuffix": "/x"})))
        .await;

    assert_eq!(outcome, DeliveryOutcome::DeadLettered { attempt: 3 });
    let published = channel.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, "sdr_queue.failed");
    assert_eq!(published[0].attempt, 3);
    assert_eq!(channel.acked().await, vec![DeliveryTag(9)]);
}

#[tokio::test]
async fn missing_routing_fields_fail_without_http_call() {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let channel = Arc::new(MockChannel::new());
    let executor = executor(&channel, local(&server), 5, CancellationToken::new());

    let no_suffix = executor.deliver(message(1, 1, json!({"httpRequest": "PUT"}))).await;
    let blank_method = executor
        .deliver(message(2, 1, json!({"httpRequest": "  ", "urlSuffix": "/x"})))
        .await;

    assert_eq!(no_suffix, DeliveryOutcome::RetryScheduled { next_attempt: 2 });
    assert_eq!(blank_method, DeliveryOutcome::RetryScheduled { next_attempt: 2 });
    assert_eq!(channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
}

#[tokio::test]
async fn failed_republish_nacks_without_ack() {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let channel = Arc::new(MockChannel::new());
    channel.fail_publish_to("sdr_queue.retry").await;
    let executor = executor(&channel, local(&server), 5, CancellationToken::new());

    let outcome = executor
        .deliver(message(3, 1, json!({"httpRequest": "PUT", "urlSuffix": "/x"})))
        .await;

    assert_eq!(outcome, DeliveryOutcome::Dropped);
    assert_eq!(channel.ops().await, vec![ChannelOp::Nack(DeliveryTag(3))]);
}

#[tokio::test]
async fn reject_parks_raw_body_with_original_attempt() {
    let channel = Arc::new(MockChannel::new());
    let executor = executor(
        &channel,
        ApiTarget::Azure { base_url: "http://unused.invalid".into() },
        5,
        CancellationToken::new(),
    );

    let outcome = executor
        .reject(DeliveryTag(11), Bytes::from_static(b"not json"), 4, "body is not JSON")
        .await;

    assert_eq!(outcome, DeliveryOutcome::DeadLettered { attempt: 4 });
    assert_eq!(channel.ops().await, vec![
        ChannelOp::Published(PublishedMessage {
            queue: "sdr_queue.failed".to_string(),
            body: Bytes::from_static(b"not json"),
            attempt: 4,
        }),
        ChannelOp::Ack(DeliveryTag(11)),
    ]);
}

#[tokio::test]
async fn shutdown_leaves_delivery_unresolved() {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let channel = Arc::new(MockChannel::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let executor = executor(&channel, local(&server), 5, cancel);

    let outcome = executor
        .deliver(message(5, 1, json!({"httpRequest": "PUT", "urlSuffix": "/x"})))
        .await;

    assert_eq!(outcome, DeliveryOutcome::Unresolved);
    assert!(channel.ops().await.is_empty());
}

#[tokio::test]
async fn failure_against_codespace_triggers_wake() {
    let backend = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(502)).mount(&backend).await;

    let github = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/user/codespaces/dev-box/start"))
        .and(matchers::header("authorization", "Bearer ghp_secret"))
        .and(matchers::body_json(json!({"codespace_name": "dev-box"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&github)
        .await;

    let wake = WakeCoordinator::new(
        WakeSettings {
            start_url: format!("{}/user/codespaces/{{codespace}}/start", github.uri()),
            name: "dev-box".into(),
            token: "ghp_secret".into(),
            passphrase: "passphrase".into(),
            cooldown: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        },
        Arc::new(RealClock::new()),
    )
    .unwrap();

    let channel = Arc::new(MockChannel::new());
    let executor = executor(
        &channel,
        ApiTarget::Codespace { base_url: backend.uri() },
        5,
        CancellationToken::new(),
    )
    .with_wake(Arc::new(wake));

    let outcome = executor
        .deliver(message(1, 1, json!({"httpRequest": "PUT", "urlSuffix": "/x"})))
        .await;
    assert_eq!(outcome, DeliveryOutcome::RetryScheduled { next_attempt: 2 });

    timeout(Duration::from_secs(5), async {
        while github.received_requests().await.unwrap_or_default().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("wake request should be sent");
}

#[tokio::test]
async fn failure_against_other_targets_does_not_wake() {
    let backend = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(502)).mount(&backend).await;

    let github = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(202)).expect(0).mount(&github).await;

    let wake = WakeCoordinator::new(
        WakeSettings {
            start_url: format!("{}/start/{{codespace}}", github.uri()),
            name: "dev-box".into(),
            token: "token".into(),
            passphrase: "passphrase".into(),
            cooldown: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        },
        Arc::new(RealClock::new()),
    )
    .unwrap();

    let channel = Arc::new(MockChannel::new());
    let executor = executor(&channel, local(&backend), 5, CancellationToken::new())
        .with_wake(Arc::new(wake));

    executor.deliver(message(1, 1, json!({"httpRequest": "PUT", "urlSuffix": "/x"}))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(github.received_requests().await.unwrap_or_default().is_empty());
}
