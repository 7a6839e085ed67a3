use crate::alert_feed::AlertFeed;
use crate::config::Config;
use crate::grpc::{serve_uds, MonitorRpc};
use crate::ingest::Ingestor;
use crate::mqtt;
use crate::pipeline::{build_pool, IngestStats, WorkerOptions, WorkerPool};
use crate::store;
use anyhow::{Context, Result};
use futures::future;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const FEED_DRAIN: Duration = Duration::from_secs(5);

/// The running monitor: storage pool, worker pool, query surface and MQTT listener.
pub struct MonitorService {
    config: Config,
    pool: PgPool,
    cancel: CancellationToken,
    stop_intake: CancellationToken,
    disconnect: CancellationToken,
    workers: WorkerPool,
    grpc: JoinHandle<Result<()>>,
    mqtt: Option<JoinHandle<Result<()>>>,
    alert_feed: Option<JoinHandle<()>>,
}

impl MonitorService {
    pub async fn start(config: Config) -> Result<Self> {
        let pool = build_pool(&config.database_url, config.db_pool_size)
            .await
            .context("failed to connect to database")?;
        if config.apply_schema {
            store::apply_schema(&pool).await?;
        }

        let stats = Arc::new(IngestStats::new());
        let cancel = CancellationToken::new();
        let stop_intake = CancellationToken::new();
        let disconnect = CancellationToken::new();

        let (alert_feed, alert_feed_handle) = match AlertFeed::start(&config) {
            Some((feed, handle)) => (Some(feed), Some(handle)),
            None => (None, None),
        };
        let ingestor = Ingestor::new(
            pool.clone(),
            stats.clone(),
            config.timestamp_mode,
            alert_feed,
        );
        let workers = WorkerPool::start(ingestor, WorkerOptions::from_config(&config), stats.clone());

        let grpc_service = MonitorRpc::new(pool.clone(), stats.clone());
        let grpc_path = config.grpc_socket_path.clone();
        let grpc_cancel = cancel.child_token();
        let grpc = tokio::spawn(async move { serve_uds(&grpc_path, grpc_service, grpc_cancel).await });

        let mqtt = if config.enable_mqtt_listener {
            Some(tokio::spawn(mqtt::run_listener(
                mqtt::ListenerSettings::from_config(&config),
                workers.dispatcher(),
                stats.clone(),
                stop_intake.clone(),
                disconnect.clone(),
            )))
        } else {
            tracing::info!("MQTT listener disabled");
            None
        };

        tracing::info!(
            workers = config.worker_count,
            timestamp_mode = ?config.timestamp_mode,
            auto_close_acked = config.auto_close_acked,
            "condition monitor started"
        );

        Ok(Self {
            config,
            pool,
            cancel,
            stop_intake,
            disconnect,
            workers,
            grpc,
            mqtt,
            alert_feed: alert_feed_handle,
        })
    }

    /// Runs until a shutdown signal arrives or a long-lived task exits, then shuts down.
    pub async fn run(mut self) -> Result<()> {
        let grpc = &mut self.grpc;
        let mqtt = &mut self.mqtt;
        let mqtt_exited = tokio::select! {
            res = grpc => {
                match res {
                    Ok(Ok(())) => tracing::warn!("gRPC server exited"),
                    Ok(Err(err)) => tracing::error!(error = %err, "gRPC server failed"),
                    Err(err) => tracing::error!(error = %err, "gRPC task failed"),
                }
                false
            }
            _ = async {
                match mqtt.as_mut() {
                    Some(handle) => match handle.await {
                        Ok(Ok(())) => tracing::warn!("MQTT listener exited"),
                        Ok(Err(err)) => tracing::error!(error = %err, "MQTT listener failed"),
                        Err(err) => tracing::warn!(error = %err, "MQTT task failed"),
                    },
                    None => future::pending::<()>().await,
                }
            } => true,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                false
            }
        };
        if mqtt_exited {
            self.mqtt = None;
        }
        self.shutdown().await
    }

    /// Stops intake, drains the worker queues while the MQTT session stays up so their acks reach
    /// the broker, disconnects, then stops the query surface.
    pub async fn shutdown(self) -> Result<()> {
        self.stop_intake.cancel();
        self.workers.shutdown(self.config.shutdown_drain()).await;

        self.disconnect.cancel();
        if let Some(handle) = self.mqtt {
            if !handle.is_finished() {
                if let Err(err) = handle.await {
                    tracing::warn!(error = %err, "MQTT task failed during shutdown");
                }
            }
        }

        if let Some(handle) = self.alert_feed {
            if tokio::time::timeout(FEED_DRAIN, handle).await.is_err() {
                tracing::warn!("alert feed did not flush before shutdown");
            }
        }

        self.cancel.cancel();
        if !self.grpc.is_finished() {
            match self.grpc.await {
                Ok(Err(err)) => tracing::warn!(error = %err, "gRPC server stopped with error"),
                Err(err) => tracing::warn!(error = %err, "gRPC task failed during shutdown"),
                Ok(Ok(())) => {}
            }
        }

        self.pool.close().await;
        tracing::info!("condition monitor stopped");
        Ok(())
    }
}
