use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{
    sync::{mpsc, RwLock},
    time,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    crypto::CredentialCipher,
    engine::EngineRegistry,
    error::{CoreError, CoreResult},
    models::{ErrorPayload, ReplaceSummary, ScanAccepted, ScanRecord, ScanState},
    store::Store,
};

pub type ScanRecords = Arc<RwLock<HashMap<String, ScanRecord>>>;

/// Everything a scan needs besides its connection id.
#[derive(Clone)]
pub struct ScanContext {
    pub store: Store,
    pub engines: Arc<EngineRegistry>,
    pub cipher: Arc<CredentialCipher>,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ScanJob {
    pub scan_id: String,
    pub connection_id: i64,
}

#[derive(Clone)]
pub struct ScanRunner {
    context: ScanContext,
    records: ScanRecords,
    queue_tx: mpsc::Sender<ScanJob>,
}

impl ScanRunner {
    pub fn new(context: ScanContext, queue_capacity: usize) -> (Self, mpsc::Receiver<ScanJob>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let runner = Self {
            context,
            records: Arc::new(RwLock::new(HashMap::new())),
            queue_tx,
        };
        (runner, queue_rx)
    }

    /// Creates a runner whose dispatcher is already consuming the queue.
    pub fn start(context: ScanContext, queue_capacity: usize) -> Self {
        let (runner, queue_rx) = Self::new(context, queue_capacity);
        spawn_scan_dispatcher(runner.clone(), queue_rx);
        runner
    }

    pub fn records(&self) -> ScanRecords {
        Arc::clone(&self.records)
    }

    /// Queues a scan and returns at once. The outcome is only visible through
    /// the scan record and the logs.
    pub async fn trigger(&self, connection_id: i64) -> CoreResult<ScanAccepted> {
        let now = Utc::now();
        let scan_id = Uuid::new_v4().to_string();
        let record = ScanRecord {
            scan_id: scan_id.clone(),
            connection_id,
            status: ScanState::Queued,
            message: Some("Schema scan queued".to_string()),
            error: None,
            summary: ReplaceSummary::default(),
            created_at: now,
            updated_at: now,
        };

        {
            let mut records = self.records.write().await;
            records.insert(scan_id.clone(), record);
        }

        let job = ScanJob {
            scan_id: scan_id.clone(),
            connection_id,
        };
        if let Err(err) = self.queue_tx.try_send(job) {
            warn!(connection_id, "Scan queue rejected job: {err}");
            let mut records = self.records.write().await;
            records.remove(&scan_id);
            return Err(CoreError::QueueUnavailable);
        }

        info!(scan_id = %scan_id, connection_id, "Schema scan queued");
        Ok(ScanAccepted {
            scan_id,
            connection_id,
            status: ScanState::Queued,
            message: Some("Schema scan started".to_string()),
            created_at: now,
        })
    }

    pub async fn record(&self, scan_id: &str) -> Option<ScanRecord> {
        self.records.read().await.get(scan_id).cloned()
    }

    async fn update(&self, scan_id: &str, apply: impl FnOnce(&mut ScanRecord)) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(scan_id) {
            apply(record);
            record.updated_at = Utc::now();
        }
    }

    async fn process(&self, job: ScanJob) {
        info!(scan_id = %job.scan_id, connection_id = job.connection_id, "Worker picked scan job");
        self.update(&job.scan_id, |record| {
            record.status = ScanState::Running;
            record.message = Some("Introspecting target database".to_string());
        })
        .await;

        match run_scan(&self.context, job.connection_id).await {
            Ok(summary) => {
                info!(
                    scan_id = %job.scan_id,
                    connection_id = job.connection_id,
                    nodes = summary.nodes_written,
                    edges = summary.edges_written,
                    dropped_edges = summary.edges_dropped,
                    "Scan completed"
                );
                self.update(&job.scan_id, |record| {
                    record.status = ScanState::Completed;
                    record.message = Some("Scan completed".to_string());
                    record.summary = summary;
                })
                .await;
            }
            Err(err) => {
                error!(
                    scan_id = %job.scan_id,
                    connection_id = job.connection_id,
                    code = err.code(),
                    "Scan failed: {err}"
                );
                self.update(&job.scan_id, |record| {
                    record.status = ScanState::Failed;
                    record.message = Some("Scan failed".to_string());
                    record.error = Some(ErrorPayload {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                })
                .await;
            }
        }
    }
}

/// Loads the descriptor, decrypts its secret, introspects the target and
/// replaces the stored graph. Nothing is written unless introspection
/// produced a complete graph.
pub async fn run_scan(context: &ScanContext, connection_id: i64) -> CoreResult<ReplaceSummary> {
    let descriptor = context.store.require_connection(connection_id).await?;
    let password = context.cipher.decrypt(&descriptor.encrypted_secret)?;
    let strategy = context.engines.get(&descriptor.engine_kind)?;
    let target = descriptor.target(password);

    info!(
        connection_id,
        engine = %descriptor.engine_kind,
        "Starting schema scan"
    );
    let graph = time::timeout(context.call_timeout, strategy.introspect(&target))
        .await
        .map_err(|_| {
            CoreError::IntrospectionFailure(format!(
                "introspection timed out after {}s",
                context.call_timeout.as_secs_f32()
            ))
        })??;
    drop(target);

    context.store.replace_graph(connection_id, graph).await
}

pub fn spawn_scan_dispatcher(runner: ScanRunner, mut queue_rx: mpsc::Receiver<ScanJob>) {
    tokio::spawn(async move {
        while let Some(job) = queue_rx.recv().await {
            let runner = runner.clone();
            tokio::spawn(async move { runner.process(job).await });
        }
    });
}

pub fn spawn_cleanup_worker(records: ScanRecords, retention_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = prune_finished(&records, Utc::now(), retention_seconds).await;
            if removed > 0 {
                info!(removed, "Evicted finished scan records");
            }
        }
    });
}

/// Drops completed and failed records last touched before the retention window.
pub async fn prune_finished(records: &ScanRecords, now: DateTime<Utc>, retention_seconds: u64) -> usize {
    // A retention too large to subtract from `now` never expires anything.
    let Some(cutoff) = i64::try_from(retention_seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|retention| now.checked_sub_signed(retention))
    else {
        return 0;
    };
    let mut records = records.write().await;
    let before = records.len();
    records.retain(|_, record| {
        !matches!(record.status, ScanState::Completed | ScanState::Failed)
            || record.updated_at > cutoff
    });
    before - records.len()
}
