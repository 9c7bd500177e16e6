use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::Config;
use crate::query::event::{Envelope, ErrorCode, QueryEvent, ResponseEvent};
use crate::query::handler::QueryHandler;

/// Receives query envelopes and runs each one as its own task, bounded by a
/// semaphore. One slow query never holds up the others.
pub struct QueryDispatcher {
    handler: Arc<QueryHandler>,
    rx: mpsc::Receiver<Envelope>,
    aggregate_id: i16,
    permits: Arc<Semaphore>,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
}

/// Reply side of a running query, kept here so a task that dies still gets answered.
struct Pending {
    event: QueryEvent,
    reply: oneshot::Sender<ResponseEvent>,
}

type Joined = Result<(Id, ResponseEvent), JoinError>;

impl QueryDispatcher {
    pub fn new(
        handler: Arc<QueryHandler>,
        rx: mpsc::Receiver<Envelope>,
        cfg: &Config,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        Self {
            handler,
            rx,
            aggregate_id: cfg.aggregate_id,
            permits: Arc::new(Semaphore::new(cfg.query_concurrency)),
            health,
            latency,
        }
    }

    /// Runs until every sender is gone, then waits for in-flight queries so
    /// each of them still gets its response.
    ///
    /// A permit is taken before the next envelope is read, so a saturated
    /// pool leaves envelopes queued in the channel.
    pub async fn run(mut self) {
        info!(aggregate_id = self.aggregate_id, "query dispatcher started");
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();

        loop {
            let permit = loop {
                tokio::select! {
                    permit = Arc::clone(&self.permits).acquire_owned() => break permit.ok(),
                    Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                        self.complete(joined, &mut pending)
                    }
                }
            };
            let Some(permit) = permit else { break };

            let envelope = loop {
                tokio::select! {
                    envelope = self.rx.recv() => break envelope,
                    Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                        self.complete(joined, &mut pending)
                    }
                }
            };
            let Some(envelope) = envelope else { break };
            self.dispatch(envelope, permit, &mut tasks, &mut pending);
        }

        if !tasks.is_empty() {
            info!(pending = tasks.len(), "query channel closed, draining in-flight queries");
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            self.complete(joined, &mut pending);
        }
        info!("query dispatcher stopped");
    }

    fn dispatch(
        &self,
        envelope: Envelope,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<ResponseEvent>,
        pending: &mut HashMap<Id, Pending>,
    ) {
        let Envelope { delivery, reply } = envelope;

        let event = match delivery {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping undeliverable query event");
                self.health.event_dropped();
                return;
            }
        };
        if event.aggregate_id != self.aggregate_id {
            warn!(
                aggregate_id = event.aggregate_id,
                expected = self.aggregate_id,
                correlation_id = %event.correlation_id,
                "dropping query event for another aggregate"
            );
            self.health.event_dropped();
            return;
        }

        self.health.query_started();
        let handler = Arc::clone(&self.handler);
        let health = Arc::clone(&self.health);
        let latency = Arc::clone(&self.latency);
        let task_event = event.clone();

        let handle = tasks.spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            let response = handler.handle(&task_event).await;
            latency.record(started.elapsed());
            health.query_finished(response.is_success());
            response
        });
        pending.insert(handle.id(), Pending { event, reply });
    }

    /// Delivers the task's response, or an internal failure if the task died.
    fn complete(&self, joined: Joined, pending: &mut HashMap<Id, Pending>) {
        let id = match &joined {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let Some(Pending { event, reply }) = pending.remove(&id) else {
            warn!(task = %id, "finished query task has no pending reply");
            return;
        };

        let response = match joined {
            Ok((_, response)) => response,
            Err(e) => {
                error!(correlation_id = %event.correlation_id, error = %e, "query task did not complete");
                self.health.task_panicked();
                ResponseEvent::failure(&event, ErrorCode::Internal, "query task failed".to_string())
            }
        };

        if reply.send(response).is_err() {
            debug!(correlation_id = %event.correlation_id, "response receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::db::pipeline::Pipeline;
    use crate::db::DocumentStore;
    use crate::error::{DeliveryError, StoreError};
    use crate::query::event::tests::query_event;
    use crate::report::generator::tests::{one_row, seeded_store};
    use crate::report::ids::{OsReportIds, ReportIdSource};
    use crate::report::ReportGenerator;
    use crate::types::{DocumentId, ReportId};

    const WINDOW: &str = r#"{"timestamp":{"$gt":9,"$lt":21}}"#;

    #[derive(Default)]
    struct RecordingIds {
        issued: Mutex<Vec<ReportId>>,
    }

    impl ReportIdSource for RecordingIds {
        fn next_report_id(&self) -> Result<ReportId, String> {
            let id = OsReportIds.next_report_id()?;
            self.issued.lock().unwrap().push(id);
            Ok(id)
        }
    }

    /// Slow store that records how many aggregations overlap.
    #[derive(Default)]
    struct SlowStore {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn aggregate(&self, _: &str, _: &Pipeline) -> Result<Vec<Value>, StoreError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(one_row())
        }

        async fn insert_one(&self, _: &str, _: Value) -> Result<DocumentId, StoreError> {
            Ok(DocumentId::new(1))
        }

        async fn find(&self, _: &str, _: &str, _: &str) -> Result<Vec<Value>, StoreError> {
            Ok(vec![])
        }

        async fn count(&self, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    /// Holds every aggregation until the test opens the gate.
    struct GatedStore {
        gate: Semaphore,
    }

    impl GatedStore {
        fn closed() -> Self {
            Self { gate: Semaphore::new(0) }
        }
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn aggregate(&self, _: &str, _: &Pipeline) -> Result<Vec<Value>, StoreError> {
            self.gate.acquire().await.unwrap().forget();
            Ok(one_row())
        }

        async fn insert_one(&self, _: &str, _: Value) -> Result<DocumentId, StoreError> {
            Ok(DocumentId::new(1))
        }

        async fn find(&self, _: &str, _: &str, _: &str) -> Result<Vec<Value>, StoreError> {
            Ok(vec![])
        }

        async fn count(&self, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl DocumentStore for PanickingStore {
        async fn aggregate(&self, _: &str, _: &Pipeline) -> Result<Vec<Value>, StoreError> {
            panic!("driver bug")
        }

        async fn insert_one(&self, _: &str, _: Value) -> Result<DocumentId, StoreError> {
            Ok(DocumentId::new(1))
        }

        async fn find(&self, _: &str, _: &str, _: &str) -> Result<Vec<Value>, StoreError> {
            Ok(vec![])
        }

        async fn count(&self, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    struct Harness {
        tx: mpsc::Sender<Envelope>,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
        dispatcher: tokio::task::JoinHandle<()>,
    }

    fn start(store: Arc<dyn DocumentStore>, ids: Arc<dyn ReportIdSource>, cfg: Config) -> Harness {
        let reports = Arc::new(ReportGenerator::new(store, ids, &cfg));
        let handler = Arc::new(QueryHandler::new(reports));
        let health = Arc::new(HealthState::new());
        let latency = Arc::new(LatencyStats::new());
        let (tx, rx) = mpsc::channel(64);
        let dispatcher = QueryDispatcher::new(handler, rx, &cfg, Arc::clone(&health), Arc::clone(&latency));
        Harness { tx, health, latency, dispatcher: tokio::spawn(dispatcher.run()) }
    }

    async fn send(tx: &mpsc::Sender<Envelope>, aggregate_id: i16) -> oneshot::Receiver<ResponseEvent> {
        let (envelope, reply) = Envelope::new(Ok(query_event(aggregate_id, WINDOW)));
        tx.send(envelope).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn concurrent_queries_each_get_their_own_report() {
        let store = seeded_store().await;
        let ids = Arc::new(RecordingIds::default());
        let cfg = Config::default();
        let h = start(Arc::clone(&store), ids.clone(), cfg.clone());

        let mut replies = Vec::new();
        for _ in 0..12 {
            replies.push(send(&h.tx, cfg.aggregate_id).await);
        }
        let mut correlations = HashSet::new();
        for reply in replies {
            let resp = reply.await.unwrap();
            assert!(resp.is_success(), "{resp:?}");
            correlations.insert(resp.correlation_id);
        }

        assert_eq!(correlations.len(), 12);
        let issued: HashSet<ReportId> = ids.issued.lock().unwrap().iter().copied().collect();
        assert_eq!(issued.len(), 12);
        assert_eq!(store.count(&cfg.report_collection).await.unwrap(), 12);

        let health = h.health.snapshot();
        assert_eq!(health.queries_succeeded, 12);
        assert_eq!(health.in_flight, 0);
        assert_eq!(h.latency.snapshot().samples, 12);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_permits() {
        let store = Arc::new(SlowStore::default());
        let cfg = Config { query_concurrency: 2, ..Config::default() };
        let h = start(store.clone(), Arc::new(OsReportIds), cfg.clone());

        let mut replies = Vec::new();
        for _ in 0..8 {
            replies.push(send(&h.tx, cfg.aggregate_id).await);
        }
        for reply in replies {
            assert!(reply.await.unwrap().is_success());
        }
        let peak = store.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {peak}");
    }

    #[tokio::test]
    async fn undeliverable_event_gets_no_response() {
        let h = start(seeded_store().await, Arc::new(OsReportIds), Config::default());

        let malformed = serde_json::from_str::<Value>("{").unwrap_err();
        let (envelope, reply) = Envelope::new(Err(DeliveryError::Malformed(malformed)));
        h.tx.send(envelope).await.unwrap();

        assert!(reply.await.is_err());
        assert_eq!(h.health.snapshot().events_dropped, 1);
        assert_eq!(h.health.snapshot().queries_received, 0);
    }

    #[tokio::test]
    async fn other_aggregate_is_dropped() {
        let store = seeded_store().await;
        let cfg = Config::default();
        let h = start(Arc::clone(&store), Arc::new(OsReportIds), cfg.clone());

        let reply = send(&h.tx, cfg.aggregate_id + 1).await;
        assert!(reply.await.is_err());
        assert_eq!(h.health.snapshot().events_dropped, 1);
        assert_eq!(store.count(&cfg.report_collection).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_the_channel_drains_in_flight_queries() {
        let cfg = Config::default();
        let h = start(Arc::new(SlowStore::default()), Arc::new(OsReportIds), cfg.clone());

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(send(&h.tx, cfg.aggregate_id).await);
        }
        drop(h.tx);
        h.dispatcher.await.unwrap();

        for mut reply in replies {
            assert!(reply.try_recv().unwrap().is_success());
        }
    }

    #[tokio::test]
    async fn saturated_pool_leaves_envelopes_in_the_channel() {
        let store = Arc::new(GatedStore::closed());
        let cfg = Config { query_concurrency: 2, ..Config::default() };
        let h = start(store.clone(), Arc::new(OsReportIds), cfg.clone());

        let mut replies = Vec::new();
        for _ in 0..5 {
            replies.push(send(&h.tx, cfg.aggregate_id).await);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.health.snapshot().queries_received, 2);
        assert_eq!(h.tx.capacity(), h.tx.max_capacity() - 3);

        store.gate.add_permits(5);
        for reply in replies {
            assert!(reply.await.unwrap().is_success());
        }
        assert_eq!(h.health.snapshot().queries_received, 5);
    }

    #[tokio::test]
    async fn panicked_query_is_answered_as_internal() {
        let h = start(Arc::new(PanickingStore), Arc::new(OsReportIds), Config::default());

        let event = query_event(Config::default().aggregate_id, WINDOW);
        let (envelope, reply) = Envelope::new(Ok(event.clone()));
        h.tx.send(envelope).await.unwrap();

        let resp = reply.await.expect("a panicked query still gets a response");
        assert_eq!(resp.error_code, Some(ErrorCode::Internal));
        assert_eq!(resp.correlation_id, event.correlation_id);
        assert_eq!(resp.aggregate_id, event.aggregate_id);

        let health = h.health.snapshot();
        assert_eq!(health.tasks_panicked, 1);
        assert_eq!(health.in_flight, 0);
    }
}
