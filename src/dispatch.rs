//! Orchestration of concurrent document dispatch.
//!
//! Documents enter through a bounded queue (coarse backpressure on top of
//! the throttler's admission control). A pump task pulls one document at a
//! time, waits for a throttler permit, and spawns the send; completion
//! order is therefore independent of enqueue order. On close the pump
//! drains everything that was accepted before reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::client::FeedClient;
use crate::document::{Document, Operation};
use crate::stats::{Stats, StatsSnapshot};
use crate::throttle::{Outcome, Permit, Throttler};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is closed")]
    Closed,

    #[error("document has an empty local id")]
    InvalidDocument,

    #[error("drain deadline elapsed with {outstanding} operations outstanding")]
    DrainTimeout { outstanding: u64 },
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Documents the internal queue holds before `enqueue` blocks.
    pub queue_capacity: usize,
    /// How long `close` waits for outstanding work. `None` waits
    /// indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drain_timeout: None,
        }
    }
}

/// Accepts documents, dispatches them through the throttler-gated client,
/// and aggregates outcomes into [`Stats`].
///
/// Lifecycle: open (accepting) → closing (draining) → closed. Stats stay
/// readable in every state. Must be created inside a tokio runtime.
pub struct Dispatcher {
    tx: Mutex<Option<mpsc::Sender<Document>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
    throttler: Arc<Throttler>,
    accepted: AtomicU64,
    drain_timeout: Option<Duration>,
    started: Instant,
}

impl Dispatcher {
    pub fn new(
        client: Arc<FeedClient>,
        throttler: Arc<Throttler>,
        opts: DispatcherOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(opts.queue_capacity.max(1));
        let stats = Arc::new(Stats::new());
        let pump = tokio::spawn(pump(
            rx,
            client,
            Arc::clone(&throttler),
            Arc::clone(&stats),
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            pump: Mutex::new(Some(pump)),
            stats,
            throttler,
            accepted: AtomicU64::new(0),
            drain_timeout: opts.drain_timeout,
            started: Instant::now(),
        }
    }

    /// Accept a document for eventual dispatch. Blocks only while the
    /// internal queue is full; the network call happens asynchronously.
    pub async fn enqueue(&self, doc: Document) -> Result<(), DispatchError> {
        if doc.id.local_id.is_empty() {
            return Err(DispatchError::InvalidDocument);
        }
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(DispatchError::Closed);
        };
        tx.send(doc).await.map_err(|_| DispatchError::Closed)?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting documents and wait until everything accepted has
    /// completed. With a drain timeout configured, a deadline overrun
    /// aborts the remaining work and reports how much was outstanding.
    ///
    /// Per-document failures are not fatal; they are visible in
    /// [`Dispatcher::stats`] only.
    pub async fn close(&self) -> Result<(), DispatchError> {
        drop(self.tx.lock().take());
        let pump = self.pump.lock().take();
        let Some(pump) = pump else {
            return Ok(());
        };
        info!("dispatcher closing, draining outstanding operations");
        match self.drain_timeout {
            None => {
                let _ = pump.await;
            }
            Some(limit) => {
                let abort = pump.abort_handle();
                if tokio::time::timeout(limit, pump).await.is_err() {
                    abort.abort();
                    let outstanding = self.outstanding();
                    warn!(outstanding, "drain deadline elapsed, aborting remaining work");
                    return Err(DispatchError::DrainTimeout { outstanding });
                }
            }
        }
        debug!(accepted = self.accepted.load(Ordering::Relaxed), "dispatcher drained");
        Ok(())
    }

    /// Point-in-time statistics, readable at any time.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Time since this dispatcher was created, for summary rendering.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The admission controller driving this dispatcher.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Accepted operations that have not produced an outcome yet.
    pub fn outstanding(&self) -> u64 {
        let snapshot = self.stats.snapshot();
        self.accepted
            .load(Ordering::Relaxed)
            .saturating_sub(snapshot.responses + snapshot.transport_errors)
    }
}

/// Pull documents, gate each on a throttler permit, fan the sends out.
async fn pump(
    mut rx: mpsc::Receiver<Document>,
    client: Arc<FeedClient>,
    throttler: Arc<Throttler>,
    stats: Arc<Stats>,
) {
    let mut tasks = JoinSet::new();
    while let Some(doc) = rx.recv().await {
        let permit = throttler.acquire().await;
        let client = Arc::clone(&client);
        let throttler = Arc::clone(&throttler);
        let stats = Arc::clone(&stats);
        tasks.spawn(dispatch_one(client, throttler, stats, permit, doc));
        // Reap finished sends so the set does not grow with the feed.
        while tasks.try_join_next().is_some() {}
    }
    while tasks.join_next().await.is_some() {}
}

async fn dispatch_one(
    client: Arc<FeedClient>,
    throttler: Arc<Throttler>,
    stats: Arc<Stats>,
    permit: Permit,
    doc: Document,
) {
    stats.record_dispatch();
    let started = Instant::now();
    let result = match doc.operation {
        Operation::Get => client.get(&doc).await,
        _ => client.send(&doc).await,
    };
    let latency = started.elapsed();
    let outcome = match result.status {
        Some(status) => {
            stats.record_response(status, result.bytes_sent, result.body.len() as u64, latency);
            if (200..300).contains(&status) {
                Outcome::Success { latency }
            } else {
                debug!(id = %doc.id, status, "document operation rejected by store");
                if status == 429 || status >= 500 {
                    Outcome::Overload
                } else {
                    Outcome::ClientError
                }
            }
        }
        None => {
            stats.record_transport_error(result.bytes_sent);
            warn!(id = %doc.id, error = ?result.error, "transport failure");
            Outcome::Overload
        }
    };
    throttler.release(permit, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientOptions, MockTransport};
    use crate::document::DocumentId;
    use url::Url;

    fn mock_client(mock: MockTransport) -> Arc<FeedClient> {
        let opts = ClientOptions::new(Url::parse("http://localhost:8080").expect("valid url"));
        Arc::new(FeedClient::new(opts, vec![Arc::new(mock)]).expect("client builds"))
    }

    fn remove_doc(local: &str) -> Document {
        Document::new(
            DocumentId::parse(&format!("id:ns:t::{local}")).expect("valid id"),
            Operation::Remove,
            None,
        )
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_local_id() {
        let mut mock = MockTransport::new();
        mock.expect_roundtrip().never();
        let dispatcher = Dispatcher::new(
            mock_client(mock),
            Arc::new(Throttler::new()),
            DispatcherOptions::default(),
        );
        let mut doc = remove_doc("x");
        doc.id.local_id = String::new();
        let result = dispatcher.enqueue(doc).await;
        assert!(matches!(result, Err(DispatchError::InvalidDocument)));
        dispatcher.close().await.expect("close");
    }

    #[tokio::test]
    async fn enqueue_after_close_is_rejected_and_stats_stay_readable() {
        let mut mock = MockTransport::new();
        mock.expect_roundtrip().returning(|_| {
            Ok(crate::client::HttpResponse {
                status: 200,
                body: bytes::Bytes::new(),
            })
        });
        let dispatcher = Dispatcher::new(
            mock_client(mock),
            Arc::new(Throttler::new()),
            DispatcherOptions::default(),
        );
        dispatcher.enqueue(remove_doc("a")).await.expect("enqueue");
        dispatcher.close().await.expect("close");

        let result = dispatcher.enqueue(remove_doc("b")).await;
        assert!(matches!(result, Err(DispatchError::Closed)));
        assert_eq!(dispatcher.stats().ok, 1);
    }

    #[tokio::test]
    async fn close_twice_is_idempotent() {
        let mut mock = MockTransport::new();
        mock.expect_roundtrip().never();
        let dispatcher = Dispatcher::new(
            mock_client(mock),
            Arc::new(Throttler::new()),
            DispatcherOptions::default(),
        );
        dispatcher.close().await.expect("first close");
        dispatcher.close().await.expect("second close");
    }
}
