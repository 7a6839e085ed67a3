use crate::config::Config;
use crate::ingest::{InboundMessage, Ingestor, Outcome};
use crate::mqtt::DeliveryAck;
use crate::rules::{AlertPolicy, RuleEngine};
use crate::topic;
use anyhow::{anyhow, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub received: AtomicU64,
    pub persisted: AtomicU64,
    pub dropped: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
    pub rule_failures: AtomicU64,
    pub alerts_opened: AtomicU64,
    pub alerts_closed: AtomicU64,
    pub suspicious_timestamps: AtomicU64,
    pub fallback_timestamps: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug)]
pub struct Job {
    pub message: InboundMessage,
    pub ack: Option<DeliveryAck>,
}

/// Worker index for a device. Every message of one (tenant, device) lands on the same worker.
pub fn shard_for(tenant_slug: &str, device_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    tenant_slug.hash(&mut hasher);
    device_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

#[derive(Clone)]
pub struct Dispatcher {
    senders: Arc<Vec<mpsc::Sender<Job>>>,
    stats: Arc<IngestStats>,
}

impl Dispatcher {
    /// Queues the job on its device's worker, waiting while that queue is full.
    pub async fn dispatch(&self, job: Job) -> Result<()> {
        let shard = topic::resolve(&job.message.topic)
            .map(|route| shard_for(&route.tenant_slug, &route.device_id, self.senders.len()))
            .unwrap_or(0);
        let sender = self
            .senders
            .get(shard)
            .ok_or_else(|| anyhow!("no worker for shard {shard}"))?;

        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, shard, topic = %job.message.topic, "queued message");
        if sender.send(job).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow!("worker {shard} has shut down"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub workers: usize,
    pub queue: usize,
    pub message_timeout: Duration,
    pub window_idle_ttl: Duration,
    pub policy: AlertPolicy,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.worker_count.max(1),
            queue: config.worker_queue.max(1),
            message_timeout: config.message_timeout(),
            window_idle_ttl: config.window_idle_ttl(),
            policy: AlertPolicy {
                auto_close_acked: config.auto_close_acked,
            },
        }
    }
}

pub struct WorkerPool {
    dispatcher: Dispatcher,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(ingestor: Ingestor, options: WorkerOptions, stats: Arc<IngestStats>) -> Self {
        let workers = options.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel::<Job>(options.queue.max(1));
            senders.push(tx);
            handles.push(spawn_worker(
                index,
                rx,
                ingestor.clone(),
                RuleEngine::new(options.policy),
                stats.clone(),
                options.message_timeout,
                options.window_idle_ttl,
            ));
        }
        tracing::info!(workers, queue = options.queue, "worker pool started");

        Self {
            dispatcher: Dispatcher {
                senders: Arc::new(senders),
                stats,
            },
            handles,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Closes the queues and waits up to `drain` for workers to finish what is already queued.
    /// Clones handed out by [`WorkerPool::dispatcher`] must be dropped first.
    pub async fn shutdown(self, drain: Duration) {
        drop(self.dispatcher);
        let joined = tokio::time::timeout(drain, futures::future::join_all(self.handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "worker task failed");
                    }
                }
                tracing::info!("worker pool drained");
            }
            Err(_) => tracing::warn!(?drain, "worker pool drain timed out"),
        }
    }
}

fn spawn_worker(
    index: usize,
    mut rx: mpsc::Receiver<Job>,
    ingestor: Ingestor,
    mut engine: RuleEngine,
    stats: Arc<IngestStats>,
    message_timeout: Duration,
    window_idle_ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = engine.prune_idle(window_idle_ttl);
                    if pruned > 0 {
                        tracing::debug!(
                            worker = index,
                            pruned,
                            remaining = engine.window_count(),
                            "dropped idle windows"
                        );
                    }
                }
                job = rx.recv() => {
                    match job {
                        Some(job) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            handle_job(index, job, &ingestor, &mut engine, &stats, message_timeout).await;
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(worker = index, "worker stopped");
    })
}

async fn handle_job(
    index: usize,
    job: Job,
    ingestor: &Ingestor,
    engine: &mut RuleEngine,
    stats: &IngestStats,
    message_timeout: Duration,
) {
    let Job { message, ack } = job;
    let route = topic::resolve(&message.topic);
    let span = tracing::info_span!("message", worker = index, topic = %message.topic);
    let result = tokio::time::timeout(message_timeout, ingestor.process(engine, message))
        .instrument(span)
        .await;

    match result {
        Ok(Ok(outcome)) => {
            match &outcome {
                Outcome::Persisted { .. } | Outcome::StateRecorded => {
                    IngestStats::incr(&stats.persisted);
                }
                Outcome::Dropped(reason) => {
                    IngestStats::incr(&stats.dropped);
                    tracing::debug!(worker = index, reason = %reason, "dropped message");
                }
            }
            stats.clear_error();
            if let Some(ack) = ack {
                ack.ack();
            }
        }
        Ok(Err(err)) => {
            IngestStats::incr(&stats.failures);
            stats.record_error(err.to_string());
            tracing::warn!(worker = index, error = %err, "message processing failed; requesting redelivery");
            if let Some(ack) = ack {
                ack.redeliver();
            }
        }
        Err(_) => {
            IngestStats::incr(&stats.timeouts);
            stats.record_error("message processing timed out");
            // Processing stopped at an unknown point; reseed the device's windows from storage.
            if let Some(route) = &route {
                engine.invalidate_asset(&route.device_id);
            }
            tracing::warn!(worker = index, ?message_timeout, "message processing timed out; requesting redelivery");
            if let Some(ack) = ack {
                ack.redeliver();
            }
        }
    }
}
