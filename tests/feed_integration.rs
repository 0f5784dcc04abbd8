//! End-to-end feeding runs against scripted transports: decode → enqueue
//! → throttled dispatch → stats summary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use url::Url;

use docfeed::client::{
    ClientOptions, FeedClient, HttpRequest, HttpResponse, Transport, TransportError,
};
use docfeed::dispatch::{DispatchError, Dispatcher, DispatcherOptions};
use docfeed::document::{Document, DocumentId, Operation};
use docfeed::feed::feed;
use docfeed::throttle::{Throttler, ThrottlerOptions};

/// Responds 503 to the first `fail_first` calls and 200 afterwards, while
/// recording the concurrent-call high-water mark.
struct ScriptedTransport {
    calls: AtomicUsize,
    concurrent: AtomicUsize,
    high_water: AtomicUsize,
    fail_first: usize,
    delay: Duration,
}

impl ScriptedTransport {
    fn new(fail_first: usize, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            fail_first,
            delay,
        }
    }

    fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn roundtrip(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        if call < self.fail_first {
            Ok(HttpResponse {
                status: 503,
                body: Bytes::from_static(b"{\"message\":\"overloaded\"}"),
            })
        } else {
            Ok(HttpResponse {
                status: 200,
                body: Bytes::from_static(b"{\"message\":\"OK\"}"),
            })
        }
    }
}

/// Every call fails before an HTTP response exists.
struct RefusingTransport;

#[async_trait]
impl Transport for RefusingTransport {
    async fn roundtrip(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Err("connection refused".into())
    }
}

fn dispatcher_over(
    transport: Arc<dyn Transport>,
    throttler_opts: ThrottlerOptions,
) -> Dispatcher {
    let opts = ClientOptions::new(Url::parse("http://localhost:8080").expect("valid url"));
    let client = Arc::new(FeedClient::new(opts, vec![transport]).expect("client builds"));
    Dispatcher::new(
        client,
        Arc::new(Throttler::with_options(throttler_opts)),
        DispatcherOptions::default(),
    )
}

fn remove_doc(local: &str) -> Document {
    Document::new(
        DocumentId::parse(&format!("id:ns:t::{local}")).expect("valid id"),
        Operation::Remove,
        None,
    )
}

#[tokio::test]
async fn single_put_produces_the_expected_summary() {
    let transport = Arc::new(ScriptedTransport::new(0, Duration::ZERO));
    let dispatcher = dispatcher_over(transport, ThrottlerOptions::default());

    let input = r#"{"put":"id:ns:type::doc1","fields":{"foo":"123"}}"#;
    let report = feed(input.as_bytes(), &dispatcher).await.expect("feed runs");
    assert_eq!(report.fed, 1);
    assert_eq!(report.skipped, 0);
    dispatcher.close().await.expect("close drains");

    let stats = dispatcher.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.responses + stats.transport_errors, stats.requests);

    let summary = stats.summary(dispatcher.elapsed());
    assert_eq!(summary["feeder.ok.count"], json!(1));
    assert_eq!(summary["feeder.error.count"], json!(0));
    assert_eq!(summary["feeder.inflight.count"], json!(0));
    assert_eq!(summary["http.response.code.counts"], json!({"200": 1}));
    assert_eq!(summary["http.request.count"], json!(1));
}

#[tokio::test]
async fn overloaded_store_shrinks_the_window_and_errors_are_counted() {
    let transport = Arc::new(ScriptedTransport::new(10, Duration::ZERO));
    let dispatcher = dispatcher_over(Arc::clone(&transport) as _, ThrottlerOptions::default());

    let initial_window = dispatcher.throttler().window();
    for i in 0..10 {
        dispatcher
            .enqueue(remove_doc(&format!("doc{i}")))
            .await
            .expect("enqueue accepted");
    }
    // Wait for the leading 503s to be released before asserting the shrink.
    for _ in 0..1000 {
        if dispatcher.stats().failed == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(dispatcher.stats().failed, 10);
    assert!(
        dispatcher.throttler().window() < initial_window,
        "window should have shrunk during the 503 run (still {})",
        dispatcher.throttler().window()
    );

    for i in 10..100 {
        dispatcher
            .enqueue(remove_doc(&format!("doc{i}")))
            .await
            .expect("enqueue accepted");
    }
    dispatcher.close().await.expect("close drains");

    let stats = dispatcher.stats();
    assert_eq!(stats.requests, 100);
    assert_eq!(stats.ok, 90);
    assert_eq!(stats.failed, 10);
    assert_eq!(stats.transport_errors, 0);
    assert_eq!(stats.responses + stats.transport_errors, stats.requests);
    assert_eq!(stats.status_counts.get(&503), Some(&10));
    assert_eq!(stats.status_counts.get(&200), Some(&90));

    let summary = stats.summary(dispatcher.elapsed());
    assert_eq!(summary["feeder.error.count"], json!(10));
    assert_eq!(summary["feeder.ok.count"], json!(90));
}

#[tokio::test]
async fn inflight_calls_never_exceed_the_window_ceiling() {
    let transport = Arc::new(ScriptedTransport::new(0, Duration::from_millis(5)));
    let dispatcher = dispatcher_over(
        Arc::clone(&transport) as _,
        ThrottlerOptions {
            min_window: 1,
            max_window: 4,
            initial_window: 4,
            ..Default::default()
        },
    );

    for i in 0..80 {
        dispatcher
            .enqueue(remove_doc(&format!("doc{i}")))
            .await
            .expect("enqueue accepted");
    }
    dispatcher.close().await.expect("close drains");

    assert_eq!(dispatcher.stats().ok, 80);
    assert!(
        transport.high_water() <= 4,
        "observed {} concurrent calls with a window ceiling of 4",
        transport.high_water()
    );
}

#[tokio::test]
async fn transport_failures_feed_the_error_count_not_the_response_count() {
    let dispatcher = dispatcher_over(Arc::new(RefusingTransport), ThrottlerOptions::default());
    for i in 0..5 {
        dispatcher
            .enqueue(remove_doc(&format!("doc{i}")))
            .await
            .expect("enqueue accepted");
    }
    dispatcher.close().await.expect("close drains");

    let stats = dispatcher.stats();
    assert_eq!(stats.requests, 5);
    assert_eq!(stats.responses, 0);
    assert_eq!(stats.transport_errors, 5);
    assert_eq!(stats.ok, 0);
    assert_eq!(stats.failed, 5);

    let summary = stats.summary(dispatcher.elapsed());
    assert_eq!(summary["feeder.error.count"], json!(5));
    assert_eq!(summary["http.response.count"], json!(0));
    assert_eq!(summary["http.response.error.count"], json!(0));
}

#[tokio::test]
async fn drain_deadline_reports_outstanding_operations() {
    let transport = Arc::new(ScriptedTransport::new(0, Duration::from_secs(30)));
    let opts = ClientOptions::new(Url::parse("http://localhost:8080").expect("valid url"));
    let client = Arc::new(FeedClient::new(opts, vec![transport as _]).expect("client builds"));
    let dispatcher = Dispatcher::new(
        client,
        Arc::new(Throttler::new()),
        DispatcherOptions {
            queue_capacity: 16,
            drain_timeout: Some(Duration::from_millis(100)),
        },
    );

    for i in 0..3 {
        dispatcher
            .enqueue(remove_doc(&format!("doc{i}")))
            .await
            .expect("enqueue accepted");
    }
    match dispatcher.close().await {
        Err(DispatchError::DrainTimeout { outstanding }) => {
            assert!(outstanding > 0, "expected outstanding operations");
        }
        other => panic!("expected DrainTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn stats_are_readable_while_operations_are_in_flight() {
    let transport = Arc::new(ScriptedTransport::new(0, Duration::from_millis(50)));
    let dispatcher = dispatcher_over(Arc::clone(&transport) as _, ThrottlerOptions::default());

    for i in 0..4 {
        dispatcher
            .enqueue(remove_doc(&format!("doc{i}")))
            .await
            .expect("enqueue accepted");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Mid-run snapshot: consistent enough to render, no waiting required.
    let mid_run = dispatcher.stats();
    assert!(mid_run.requests >= mid_run.responses + mid_run.transport_errors);

    dispatcher.close().await.expect("close drains");
    assert_eq!(dispatcher.stats().ok, 4);
}
