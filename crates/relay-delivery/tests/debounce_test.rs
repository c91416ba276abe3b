//! Debounce engine tests.
//!
//! Most tests use a virtual clock and enqueue before the worker first runs,
//! so every arrival is already queued when the worker starts racing it
//! against the window. Arrivals during an open window use the real clock.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use relay_broker::{
    mock::MockChannel, topology::QueueDeclaration, BrokerChannel, DeliveryStream, QueueTopology,
};
use relay_core::{ApiTarget, Clock, DeliveryTag, Envelope, PendingMessage, RealClock, TestClock};
use relay_delivery::{DebounceEngine, DeliveryExecutor, ForwardClient, RetryLadder};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const WINDOW: Duration = Duration::from_millis(400);

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn millis(ms: i64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms)
}

fn volume(tag: u64, at: Option<DateTime<Utc>>, level: i64) -> PendingMessage {
    let mut body = json!({
        "httpRequest": "PUT",
        "urlSuffix": "/volume",
        "deviceMessageType": 3,
        "level": level,
    });
    if let Some(at) = at {
        body["updateDate"] = Value::String(at.to_rfc3339());
    }
    let raw = Bytes::from(body.to_string());
    Envelope::parse(&raw).unwrap().into_pending(DeliveryTag(tag), raw, 1)
}

struct Harness {
    server: MockServer,
    channel: Arc<MockChannel>,
    clock: TestClock,
    cancel: CancellationToken,
    engine: DebounceEngine,
}

async fn backend(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(status)).mount(&server).await;
    server
}

fn spawn_engine(
    server: &MockServer,
    channel: Arc<dyn BrokerChannel>,
    window: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> DebounceEngine {
    let executor = DeliveryExecutor::new(
        ForwardClient::with_defaults().unwrap(),
        channel,
        ApiTarget::Local { base_url: server.uri() },
        QueueTopology::new("sdr_queue", Duration::from_secs(10)),
        RetryLadder::new(5),
        CancellationToken::new(),
    );
    DebounceEngine::spawn("render", window, Arc::new(executor), clock, cancel)
}

async fn harness(status: u16) -> Harness {
    let server = backend(status).await;
    let channel = Arc::new(MockChannel::new());
    let clock = TestClock::starting_at(start());
    let cancel = CancellationToken::new();
    let engine =
        spawn_engine(&server, channel.clone(), WINDOW, Arc::new(clock.clone()), cancel.clone());

    Harness { server, channel, clock, cancel, engine }
}

/// Channel whose first ack panics; later calls reach the inner mock.
struct AckPanicsOnce {
    inner: Arc<MockChannel>,
    armed: AtomicBool,
}

impl BrokerChannel for AckPanicsOnce {
    fn declare_queue(
        &self,
        declaration: &QueueDeclaration,
    ) -> Pin<Box<dyn Future<Output = relay_broker::Result<()>> + Send + '_>> {
        self.inner.declare_queue(declaration)
    }

    fn verify_queue(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = relay_broker::Result<()>> + Send + '_>> {
        self.inner.verify_queue(queue)
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = relay_broker::Result<DeliveryStream>> + Send + '_>> {
        self.inner.consume(queue)
    }

    fn ack(
        &self,
        delivery_tag: DeliveryTag,
    ) -> Pin<Box<dyn Future<Output = relay_broker::Result<()>> + Send + '_>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("ack of {delivery_tag} blew up");
        }
        self.inner.ack(delivery_tag)
    }

    fn nack(
        &self,
        delivery_tag: DeliveryTag,
    ) -> Pin<Box<dyn Future<Output = relay_broker::Result<()>> + Send + '_>> {
        self.inner.nack(delivery_tag)
    }

    fn publish(
        &self,
        queue: &str,
        body: Bytes,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = relay_broker::Result<()>> + Send + '_>> {
        self.inner.publish(queue, body, attempt)
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = relay_broker::Result<()>> + Send + '_>> {
        self.inner.close()
    }
}

async fn forwarded_levels(server: &MockServer) -> Vec<i64> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            body["level"].as_i64().unwrap()
        })
        .collect()
}

async fn settle(harness: &Harness, resolved: usize) {
    timeout(Duration::from_secs(5), harness.channel.wait_for_resolved(resolved))
        .await
        .expect("deliveries should resolve");
}

#[tokio::test]
async fn burst_within_window_forwards_only_latest() {
    let h = harness(200).await;
    h.engine.enqueue(volume(1, Some(start()), 10)).unwrap();
    h.engine.enqueue(volume(2, Some(start() + millis(100)), 20)).unwrap();
    h.engine.enqueue(volume(3, Some(start() + millis(250)), 30)).unwrap();

    settle(&h, 3).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![30]);
    assert_eq!(h.channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2), DeliveryTag(3)]);
    assert!(h.channel.published().await.is_empty());
}

#[tokio::test]
async fn gap_beyond_window_forwards_both_in_order() {
    let h = harness(200).await;
    h.engine.enqueue(volume(1, Some(start()), 10)).unwrap();
    h.engine.enqueue(volume(2, Some(start() + millis(1_000)), 20)).unwrap();

    settle(&h, 2).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![10, 20]);
    assert_eq!(h.channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
}

#[tokio::test]
async fn older_arrival_within_window_is_discarded() {
    let h = harness(200).await;
    h.engine.enqueue(volume(1, Some(start() + millis(200)), 10)).unwrap();
    h.engine.enqueue(volume(2, Some(start()), 20)).unwrap();

    settle(&h, 2).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![10]);
    assert_eq!(h.channel.acked().await, vec![DeliveryTag(2), DeliveryTag(1)]);
}

#[tokio::test]
async fn window_closes_without_further_messages() {
    let h = harness(200).await;
    h.engine.enqueue(volume(1, Some(start()), 10)).unwrap();

    settle(&h, 1).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![10]);
    assert_eq!(h.clock.elapsed(), WINDOW);
}

#[tokio::test]
async fn device_clock_ahead_waits_at_most_one_window() {
    let h = harness(200).await;
    h.engine.enqueue(volume(1, Some(start() + chrono::Duration::hours(1)), 10)).unwrap();

    settle(&h, 1).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![10]);
    assert_eq!(h.clock.elapsed(), WINDOW);
}

#[tokio::test]
async fn late_burst_is_coalesced_without_waiting() {
    let h = harness(200).await;
    let an_hour = chrono::Duration::hours(1);
    h.clock.jump_to(SystemTime::from(start() + an_hour));
    h.engine.enqueue(volume(1, Some(start()), 10)).unwrap();
    h.engine.enqueue(volume(2, Some(start() + millis(100)), 20)).unwrap();

    settle(&h, 2).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![20]);
    assert_eq!(h.channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
    assert_eq!(h.clock.elapsed(), an_hour.to_std().unwrap());
}

#[tokio::test]
async fn arrival_during_open_window_replaces_waiting_message() {
    let server = backend(200).await;
    let channel = Arc::new(MockChannel::new());
    let window = Duration::from_millis(300);
    let engine = spawn_engine(
        &server,
        channel.clone(),
        window,
        Arc::new(RealClock::new()),
        CancellationToken::new(),
    );

    let opened = Utc::now();
    let started = Instant::now();
    engine.enqueue(volume(1, Some(opened), 10)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(forwarded_levels(&server).await.is_empty());

    engine.enqueue(volume(2, Some(opened + millis(100)), 20)).unwrap();
    timeout(Duration::from_secs(5), channel.wait_for_resolved(2))
        .await
        .expect("deliveries should resolve");

    assert_eq!(forwarded_levels(&server).await, vec![20]);
    assert_eq!(channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
    // The window restarted from the newer timestamp.
    assert!(started.elapsed() >= Duration::from_millis(350));
}

#[tokio::test]
async fn panicking_delivery_is_acked_once_and_worker_survives() {
    let server = backend(200).await;
    let inner = Arc::new(MockChannel::new());
    let channel = Arc::new(AckPanicsOnce { inner: inner.clone(), armed: AtomicBool::new(true) });
    let engine = spawn_engine(
        &server,
        channel,
        WINDOW,
        Arc::new(TestClock::starting_at(start())),
        CancellationToken::new(),
    );

    engine.enqueue(volume(1, Some(start()), 10)).unwrap();
    timeout(Duration::from_secs(5), inner.wait_for_resolved(1))
        .await
        .expect("panicked delivery should be discarded");

    engine.enqueue(volume(2, Some(start() + millis(1_000)), 20)).unwrap();
    timeout(Duration::from_secs(5), inner.wait_for_resolved(2))
        .await
        .expect("worker should keep forwarding");

    assert_eq!(inner.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
    assert!(inner.published().await.is_empty());
    assert!(inner.nacked().await.is_empty());
    assert_eq!(forwarded_levels(&server).await, vec![10, 20]);
}

#[tokio::test]
async fn undated_message_is_superseded_by_next_arrival() {
    let h = harness(200).await;
    h.engine.enqueue(volume(1, None, 10)).unwrap();
    h.engine.enqueue(volume(2, Some(start()), 20)).unwrap();

    settle(&h, 2).await;

    assert_eq!(forwarded_levels(&h.server).await, vec![20]);
    assert_eq!(h.channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
}

#[tokio::test]
async fn failed_representative_goes_through_retry_ladder() {
    let h = harness(500).await;
    h.engine.enqueue(volume(1, Some(start()), 10)).unwrap();
    h.engine.enqueue(volume(2, Some(start() + millis(50)), 20)).unwrap();

    settle(&h, 2).await;

    let published = h.channel.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, "sdr_queue.retry");
    assert_eq!(published[0].attempt, 2);
    assert_eq!(h.channel.acked().await, vec![DeliveryTag(1), DeliveryTag(2)]);
}

#[tokio::test]
async fn cancelled_worker_forwards_nothing() {
    let h = harness(200).await;
    h.cancel.cancel();
    let _ = h.engine.enqueue(volume(1, Some(start()), 10));

    timeout(Duration::from_secs(5), h.engine.join()).await.expect("worker should stop");

    assert!(h.channel.ops().await.is_empty());
    assert!(forwarded_levels(&h.server).await.is_empty());
}
