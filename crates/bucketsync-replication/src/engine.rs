//! Replication engine
//!
//! Walks the source listing page by page, maps every key into the
//! destination, picks a transfer strategy and moves the object. Failures of
//! single objects are turned into [`TransferOutcome`]s at the object
//! boundary; only a failing listing ends the run early.

use crate::error::{ReplicationError, ReplicationResult};
use crate::observer::{ReplicationEvent, ReplicationObserver};
use crate::outcome::{
    ErrorKind, ObjectTransferError, RunSummary, TransferOutcome, TransferPlan, TransferStage,
    TransferStatus,
};
use crate::progress::ProgressTracker;
use crate::strategy::{StrategySelector, TransferStrategy};
use bucketsync_core::{
    is_canonical, map_destination_key, normalize_key, CoreError, ObjectDescriptor,
    ReplicationConfig, TransferOptions,
};
use bucketsync_storage::ObjectStore;
use futures::{FutureExt, StreamExt};
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Destination keys claimed so far in a run.
///
/// Distinct canonical source keys always map to distinct destinations, so a
/// canonical claim is remembered only as a 64-bit hash. Full key strings are
/// kept for destinations claimed by (or contested with) non-canonical keys,
/// which are rare.
#[derive(Default)]
struct ClaimedKeys {
    hasher: RandomState,
    canonical: HashSet<u64>,
    irregular: HashMap<String, String>,
}

/// A destination key claimed by a second source key.
#[derive(Debug, PartialEq, Eq)]
struct Collision {
    first_source_key: String,
}

impl ClaimedKeys {
    fn claim(&mut self, destination_key: &str, source_key: &str) -> Option<Collision> {
        if let Some(previous) = self.irregular.get_mut(destination_key) {
            if previous == source_key {
                return None;
            }
            let first_source_key = std::mem::replace(previous, source_key.to_string());
            return Some(Collision { first_source_key });
        }

        let hash = self.hasher.hash_one(destination_key);
        if is_canonical(source_key) {
            self.canonical.insert(hash);
            return None;
        }

        self.irregular
            .insert(destination_key.to_string(), source_key.to_string());
        // The only canonical key sharing this destination is the normalized
        // form of this one.
        self.canonical.contains(&hash).then(|| Collision {
            first_source_key: normalize_key(source_key),
        })
    }
}

/// Moves every object of the source bucket into the destination bucket.
///
/// # Example
///
/// ```rust
/// use bucketsync_core::{BucketEndpoint, Credentials, EndpointRole, ReplicationConfig, TransferOptions};
/// use bucketsync_replication::{ReplicationEngine, TracingObserver};
/// use bucketsync_storage::MockS3ObjectStore;
/// use bytes::Bytes;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), bucketsync_replication::ReplicationError> {
/// let endpoint = |role, bucket| {
///     BucketEndpoint::new(role, bucket, "us-east-1", Credentials::new("key", "secret"))
/// };
/// let config = ReplicationConfig {
///     source: endpoint(EndpointRole::Source, "src"),
///     destination: endpoint(EndpointRole::Destination, "dst"),
///     destination_prefix: "backup".to_string(),
///     transfer: TransferOptions::default(),
/// };
///
/// let store = Arc::new(MockS3ObjectStore::new());
/// store.insert("src", "a.txt", Bytes::from("hello"));
///
/// let engine = ReplicationEngine::new(&config, store.clone(), store.clone(), Arc::new(TracingObserver));
/// let summary = engine.run().await?;
/// assert_eq!(summary.succeeded, 1);
/// assert_eq!(store.object("dst", "backup/a.txt"), Some(Bytes::from("hello")));
/// # Ok(())
/// # }
/// ```
pub struct ReplicationEngine {
    worker: ObjectWorker,
    destination_prefix: String,
    options: TransferOptions,
    selector: StrategySelector,
    observer: Arc<dyn ReplicationObserver>,
    cancel: CancellationToken,
}

impl ReplicationEngine {
    /// Create an engine over already-constructed stores.
    pub fn new(
        config: &ReplicationConfig,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Self {
        let selector =
            StrategySelector::new(&config.source, &config.destination, &config.transfer);

        Self {
            worker: ObjectWorker {
                source,
                destination,
                source_bucket: config.source.bucket.clone(),
                destination_bucket: config.destination.bucket.clone(),
                dry_run: config.transfer.dry_run,
                observer: observer.clone(),
            },
            destination_prefix: config.destination_prefix.clone(),
            options: config.transfer.clone(),
            selector,
            observer,
            cancel: CancellationToken::new(),
        }
    }

    /// Validate `config`, then build both clients.
    pub async fn connect(
        config: &ReplicationConfig,
        observer: Arc<dyn ReplicationObserver>,
    ) -> ReplicationResult<Self> {
        config.validate()?;

        let part_size = config.transfer.part_size;
        let source = bucketsync_storage::connect(&config.source, part_size)
            .await
            .map_err(|source| ReplicationError::Client {
                role: config.source.role,
                source,
            })?;
        let destination = bucketsync_storage::connect(&config.destination, part_size)
            .await
            .map_err(|source| ReplicationError::Client {
                role: config.destination.role,
                source,
            })?;

        Ok(Self::new(config, source, destination, observer))
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the replication to completion (or cancellation).
    ///
    /// Returns `Err` only when the source listing fails; the error carries
    /// the summary of everything processed before that.
    pub async fn run(&self) -> ReplicationResult<RunSummary> {
        let mut summary = RunSummary::start(self.options.dry_run);
        let mut claimed = ClaimedKeys::default();

        self.observer.on_event(&ReplicationEvent::RunStarted {
            source_bucket: self.worker.source_bucket.clone(),
            destination_bucket: self.worker.destination_bucket.clone(),
            destination_prefix: self.destination_prefix.clone(),
            dry_run: self.options.dry_run,
        });
        if !self.selector.copy_eligible() {
            debug!("Server-side copy unavailable for this run; all objects will be streamed");
        }

        let mut continuation: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();
        let mut page_number = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let page = match self
                .worker
                .source
                .list_page(
                    &self.worker.source_bucket,
                    self.options.source_prefix.as_deref(),
                    continuation.take(),
                )
                .await
            {
                Ok(page) => page,
                Err(source) => return Err(self.enumeration_failed(source, summary)),
            };

            if let Some(token) = &page.next_continuation {
                if !seen_tokens.insert(token.clone()) {
                    let source = CoreError::MalformedResponse(format!(
                        "listing returned continuation token {:?} a second time",
                        token
                    ));
                    return Err(self.enumeration_failed(source, summary));
                }
            }

            page_number += 1;
            self.observer.on_event(&ReplicationEvent::PageListed {
                page: page_number,
                objects: page.objects.len(),
                has_more: page.has_more(),
            });

            let next = page.next_continuation;
            if self.options.concurrency > 1 {
                self.process_concurrent(page.objects, &mut claimed, &mut summary)
                    .await;
            } else {
                self.process_sequential(page.objects, &mut claimed, &mut summary)
                    .await;
            }

            if summary.cancelled {
                break;
            }
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        summary.finish();
        if summary.cancelled {
            info!(
                processed = summary.total,
                "Replication cancelled; in-flight transfers were allowed to finish"
            );
        }
        self.observer.on_event(&ReplicationEvent::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    fn enumeration_failed(&self, source: CoreError, mut summary: RunSummary) -> ReplicationError {
        summary.finish();
        error!(
            bucket = %self.worker.source_bucket,
            processed = summary.total,
            error = %source,
            "Error listing objects in bucket"
        );
        ReplicationError::Enumeration {
            bucket: self.worker.source_bucket.clone(),
            source,
            partial: Box::new(summary),
        }
    }

    /// Map the key, check for collisions and pick the strategy.
    fn plan(
        &self,
        object: ObjectDescriptor,
        claimed: &mut ClaimedKeys,
        summary: &mut RunSummary,
    ) -> TransferPlan {
        let destination_key = map_destination_key(&object.key, &self.destination_prefix);

        if let Some(collision) = claimed.claim(&destination_key, &object.key) {
            summary.record_collision();
            self.observer.on_event(&ReplicationEvent::KeyCollision {
                destination_key: destination_key.clone(),
                first_source_key: collision.first_source_key,
                second_source_key: object.key.clone(),
            });
        }

        TransferPlan {
            strategy: self.selector.select(object.size),
            source_key: object.key,
            destination_key,
            size: object.size,
        }
    }

    async fn process_sequential(
        &self,
        objects: Vec<ObjectDescriptor>,
        claimed: &mut ClaimedKeys,
        summary: &mut RunSummary,
    ) {
        for object in objects {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let plan = self.plan(object, claimed, summary);
            let outcome = self.worker.execute(plan).await;
            summary.record(&outcome);
        }
    }

    /// Up to `concurrency` objects in flight; outcomes are folded into the
    /// summary here, in completion order.
    async fn process_concurrent(
        &self,
        objects: Vec<ObjectDescriptor>,
        claimed: &mut ClaimedKeys,
        summary: &mut RunSummary,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks = JoinSet::new();

        for object in objects {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let plan = self.plan(object, claimed, summary);
            let worker = self.worker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.execute_isolated(plan).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => error!(error = %e, "Transfer task did not complete"),
            }
        }
    }
}

/// Everything needed to transfer one object; cloned into worker tasks.
#[derive(Clone)]
struct ObjectWorker {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    source_bucket: String,
    destination_bucket: String,
    dry_run: bool,
    observer: Arc<dyn ReplicationObserver>,
}

impl ObjectWorker {
    async fn execute(&self, plan: TransferPlan) -> TransferOutcome {
        self.observer.on_event(&ReplicationEvent::ObjectStarted { plan: plan.clone() });

        let result = if self.dry_run {
            Ok(0)
        } else {
            debug!(key = %plan.source_key, state = %plan.active_state(), "Transferring object");
            match plan.strategy {
                TransferStrategy::ServerSideCopy => self.copy(&plan).await,
                TransferStrategy::Streamed => self.stream(&plan).await,
            }
        };

        let outcome = TransferOutcome::from_result(plan, result);
        self.report(&outcome);
        outcome
    }

    /// [`Self::execute`], with a panicking transfer recorded as a failure.
    async fn execute_isolated(self, plan: TransferPlan) -> TransferOutcome {
        let fallback = plan.clone();
        match AssertUnwindSafe(self.execute(plan)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                let stage = match fallback.strategy {
                    TransferStrategy::ServerSideCopy => TransferStage::Copy,
                    TransferStrategy::Streamed => TransferStage::Write,
                };
                let outcome = TransferOutcome::from_result(
                    fallback,
                    Err(ObjectTransferError::new(
                        ErrorKind::Other,
                        stage,
                        "transfer task panicked",
                    )),
                );
                self.report(&outcome);
                outcome
            }
        }
    }

    fn report(&self, outcome: &TransferOutcome) {
        let event = match &outcome.status {
            TransferStatus::Succeeded { bytes } => ReplicationEvent::ObjectSucceeded {
                source_key: outcome.source_key.clone(),
                destination_key: outcome.destination_key.clone(),
                strategy: outcome.strategy,
                bytes: *bytes,
            },
            TransferStatus::Failed(error) => ReplicationEvent::ObjectFailed {
                source_key: outcome.source_key.clone(),
                destination_key: outcome.destination_key.clone(),
                strategy: outcome.strategy,
                error: error.clone(),
            },
        };
        self.observer.on_event(&event);
    }

    async fn copy(&self, plan: &TransferPlan) -> Result<u64, ObjectTransferError> {
        self.destination
            .copy(
                &self.source_bucket,
                &plan.source_key,
                &self.destination_bucket,
                &plan.destination_key,
            )
            .await
            .map_err(|e| ObjectTransferError::from_core(TransferStage::Copy, e))?;

        Ok(plan.size.unwrap_or(0))
    }

    async fn stream(&self, plan: &TransferPlan) -> Result<u64, ObjectTransferError> {
        let body = self
            .source
            .get(&self.source_bucket, &plan.source_key)
            .await
            .map_err(|e| ObjectTransferError::from_core(TransferStage::Read, e))?;

        let declared = plan.size.or(body.content_length);
        let tracker = Arc::new(ProgressTracker::new(
            plan.source_key.clone(),
            declared,
            self.observer.clone(),
        ));
        let read_failed = Arc::new(AtomicBool::new(false));

        let counted = {
            let tracker = tracker.clone();
            let read_failed = read_failed.clone();
            body.stream
                .inspect(move |chunk| match chunk {
                    Ok(bytes) => tracker.on_bytes(bytes.len() as u64),
                    Err(_) => read_failed.store(true, Ordering::Release),
                })
                .boxed()
        };

        let written = self
            .destination
            .put(&self.destination_bucket, &plan.destination_key, counted, declared)
            .await
            .map_err(|e| {
                let stage = if read_failed.load(Ordering::Acquire) {
                    TransferStage::Read
                } else {
                    TransferStage::Write
                };
                ObjectTransferError::from_core(stage, e)
            })?;

        tracker.finish();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use bucketsync_core::{BucketEndpoint, Credentials, EndpointRole};
    use bucketsync_storage::object_store::{MockFailure, MockOperation, MockS3ObjectStore};
    use bytes::Bytes;

    fn config(prefix: &str) -> ReplicationConfig {
        let endpoint = |role, bucket| {
            BucketEndpoint::new(role, bucket, "us-east-1", Credentials::new("key", "secret"))
        };
        ReplicationConfig {
            source: endpoint(EndpointRole::Source, "src"),
            destination: endpoint(EndpointRole::Destination, "dst"),
            destination_prefix: prefix.to_string(),
            transfer: TransferOptions::default(),
        }
    }

    fn engine(
        config: &ReplicationConfig,
        store: &Arc<MockS3ObjectStore>,
    ) -> (ReplicationEngine, Arc<RecordingObserver>) {
        let recorder = Arc::new(RecordingObserver::new());
        let engine = ReplicationEngine::new(config, store.clone(), store.clone(), recorder.clone());
        (engine, recorder)
    }

    #[tokio::test]
    async fn test_same_account_uses_server_side_copy() {
        let store = Arc::new(MockS3ObjectStore::new());
        store.insert("src", "a.txt", Bytes::from("hello"));

        let (engine, _) = engine(&config("backup"), &store);
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.bytes_transferred, 5);
        assert_eq!(store.calls(MockOperation::Copy), 1);
        assert_eq!(store.calls(MockOperation::Get), 0);
        assert_eq!(store.object("dst", "backup/a.txt"), Some(Bytes::from("hello")));
    }

    #[tokio::test]
    async fn test_force_streamed_reads_and_writes() {
        let store = Arc::new(MockS3ObjectStore::new());
        store.insert("src", "a.txt", Bytes::from("hello"));

        let mut config = config("");
        config.transfer.force_streamed = true;
        let (engine, recorder) = engine(&config, &store);
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.calls(MockOperation::Copy), 0);
        assert_eq!(store.calls(MockOperation::Put), 1);
        assert_eq!(store.object("dst", "a.txt"), Some(Bytes::from("hello")));
        assert!(recorder.count(|e| matches!(e, ReplicationEvent::Progress { .. })) >= 1);
    }

    #[tokio::test]
    async fn test_copy_failure_is_classified() {
        let store = Arc::new(MockS3ObjectStore::new());
        store.insert("src", "a.txt", Bytes::from("hello"));
        store.fail_key(MockOperation::Copy, "a.txt", MockFailure::Denied);

        let (engine, _) = engine(&config(""), &store);
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].reason.starts_with("copy failed (permission denied)"));
    }

    #[tokio::test]
    async fn test_read_failure_is_read_stage() {
        let store = Arc::new(MockS3ObjectStore::new());
        let worker = ObjectWorker {
            source: store.clone(),
            destination: store.clone(),
            source_bucket: "src".to_string(),
            destination_bucket: "dst".to_string(),
            dry_run: false,
            observer: Arc::new(RecordingObserver::new()),
        };
        store.insert("src", "a.txt", Bytes::from("hello"));
        store.fail_key(MockOperation::Get, "a.txt", MockFailure::Transient("reset"));

        let plan = TransferPlan {
            source_key: "a.txt".to_string(),
            destination_key: "a.txt".to_string(),
            size: Some(5),
            strategy: TransferStrategy::Streamed,
        };
        let outcome = worker.execute(plan).await;

        let error = outcome.error().cloned().unwrap();
        assert_eq!(error.stage, TransferStage::Read);
        assert_eq!(error.kind, ErrorKind::Transient);
        assert_eq!(store.object_count("dst"), 0);
    }

    /// Lister that answers every continuation with the next token from a
    /// fixed script, forever.
    struct ScriptedLister {
        next: HashMap<Option<String>, String>,
    }

    impl ScriptedLister {
        fn new(script: &[(Option<&str>, &str)]) -> Self {
            Self {
                next: script
                    .iter()
                    .map(|(from, to)| (from.map(str::to_string), to.to_string()))
                    .collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for ScriptedLister {
        fn backend(&self) -> &'static str {
            "scripted"
        }

        async fn list_page(
            &self,
            _bucket: &str,
            _prefix: Option<&str>,
            continuation: Option<String>,
        ) -> bucketsync_core::CoreResult<bucketsync_core::ObjectPage> {
            Ok(bucketsync_core::ObjectPage {
                objects: Vec::new(),
                next_continuation: self.next.get(&continuation).cloned(),
            })
        }

        async fn get(
            &self,
            _bucket: &str,
            key: &str,
        ) -> bucketsync_core::CoreResult<bucketsync_storage::ObjectBody> {
            Err(CoreError::not_found("object", key))
        }

        async fn put(
            &self,
            _bucket: &str,
            key: &str,
            _body: bucketsync_storage::ByteStream,
            _size_hint: Option<u64>,
        ) -> bucketsync_core::CoreResult<u64> {
            Err(CoreError::not_found("object", key))
        }

        async fn copy(
            &self,
            _source_bucket: &str,
            source_key: &str,
            _destination_bucket: &str,
            _destination_key: &str,
        ) -> bucketsync_core::CoreResult<()> {
            Err(CoreError::not_found("object", source_key))
        }
    }

    async fn run_scripted(script: &[(Option<&str>, &str)]) -> (ReplicationError, usize) {
        let store: Arc<dyn ObjectStore> = Arc::new(ScriptedLister::new(script));
        let recorder = Arc::new(RecordingObserver::new());
        let engine = ReplicationEngine::new(&config(""), store.clone(), store, recorder.clone());

        let err = engine.run().await.unwrap_err();
        let pages = recorder.count(|e| matches!(e, ReplicationEvent::PageListed { .. }));
        (err, pages)
    }

    #[tokio::test]
    async fn test_repeated_continuation_token_is_enumeration_error() {
        let (err, pages) = run_scripted(&[(None, "same"), (Some("same"), "same")]).await;

        assert_eq!(pages, 1);
        assert!(matches!(
            err,
            ReplicationError::Enumeration {
                source: CoreError::MalformedResponse(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_continuation_cycle_is_enumeration_error() {
        let (err, pages) =
            run_scripted(&[(None, "A"), (Some("A"), "B"), (Some("B"), "A")]).await;

        assert_eq!(pages, 2);
        assert!(matches!(
            err,
            ReplicationError::Enumeration {
                source: CoreError::MalformedResponse(_),
                ..
            }
        ));
    }

    #[test]
    fn test_canonical_claims_keep_no_key_strings() {
        let mut claimed = ClaimedKeys::default();
        for i in 0..1000 {
            let key = format!("dir-{}/obj-{:04}.bin", i % 7, i);
            let destination = map_destination_key(&key, "backup");
            assert_eq!(claimed.claim(&destination, &key), None);
        }

        assert_eq!(claimed.canonical.len(), 1000);
        assert!(claimed.irregular.is_empty());
    }

    #[test]
    fn test_claims_detect_collisions_in_either_order() {
        let mut claimed = ClaimedKeys::default();
        assert_eq!(claimed.claim("p/a/b", "a/b"), None);
        assert_eq!(
            claimed.claim("p/a/b", "a//b"),
            Some(Collision {
                first_source_key: "a/b".to_string()
            })
        );

        let mut claimed = ClaimedKeys::default();
        assert_eq!(claimed.claim("p/a/b", "a//b"), None);
        assert_eq!(
            claimed.claim("p/a/b", "a/b"),
            Some(Collision {
                first_source_key: "a//b".to_string()
            })
        );
        assert_eq!(
            claimed.claim("p/a/b", "/a/b"),
            Some(Collision {
                first_source_key: "a/b".to_string()
            })
        );
        assert_eq!(claimed.irregular.len(), 1);
    }
}
