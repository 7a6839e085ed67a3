use crate::pipeline::IngestStats;
use crate::store::{
    self, AlertRecord, AlertTransitionError, OperatorTransition, ReadingsQuery, SeriesPoint,
};
use crate::tenant::{resolve_tenant, run_in_tenant_scope, TenantScopeError};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::PgPool;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;
use uuid::Uuid;

pub mod proto {
    tonic::include_proto!("condition.monitor.v1");
}

use proto::condition_monitor_server::{ConditionMonitor, ConditionMonitorServer};
use proto::{
    Alert as RpcAlert, AlertTarget, HealthRequest, HealthResponse, ListActiveAlertsRequest,
    ListActiveAlertsResponse, QueryReadingsRequest, QueryReadingsResponse, ReadingPoint,
    TransitionAlertRequest, TransitionAlertResponse,
};

const DEFAULT_QUERY_SPAN_HOURS: i64 = 24;

#[derive(Clone)]
pub struct MonitorRpc {
    pool: PgPool,
    stats: Arc<IngestStats>,
}

impl MonitorRpc {
    pub fn new(pool: PgPool, stats: Arc<IngestStats>) -> Self {
        Self { pool, stats }
    }

    fn to_health(&self) -> HealthResponse {
        let stats = &self.stats;
        let load = |counter: &std::sync::atomic::AtomicU64| counter.load(Ordering::Relaxed);
        HealthResponse {
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            queue_depth: load(&stats.queue_depth),
            received: load(&stats.received),
            persisted: load(&stats.persisted),
            dropped: load(&stats.dropped),
            timeouts: load(&stats.timeouts),
            failures: load(&stats.failures),
            rule_failures: load(&stats.rule_failures),
            alerts_opened: load(&stats.alerts_opened),
            alerts_closed: load(&stats.alerts_closed),
            suspicious_timestamps: load(&stats.suspicious_timestamps),
            fallback_timestamps: load(&stats.fallback_timestamps),
            last_error: stats.last_error().unwrap_or_default(),
            build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn tenant_id(&self, slug: &str) -> Result<Uuid, Status> {
        let slug = required(slug, "tenant_slug")?;
        resolve_tenant(&self.pool, slug)
            .await
            .map_err(status_from_error)?
            .ok_or_else(|| Status::not_found(format!("unknown tenant `{slug}`")))
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Status::invalid_argument(format!("{field} is required")));
    }
    Ok(trimmed)
}

fn millis(ms: i64, field: &str) -> Result<DateTime<Utc>, Status> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Status::invalid_argument(format!("invalid {field}")))
}

/// `to_ms == 0` means now; `from_ms == 0` means one day before `to`.
fn query_range(
    from_ms: i64,
    to_ms: i64,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), Status> {
    let to = if to_ms == 0 { now } else { millis(to_ms, "to_ms")? };
    let from = if from_ms == 0 {
        to.checked_sub_signed(ChronoDuration::hours(DEFAULT_QUERY_SPAN_HOURS))
            .ok_or_else(|| Status::invalid_argument("to_ms leaves no room for default range"))?
    } else {
        millis(from_ms, "from_ms")?
    };
    if to < from {
        return Err(Status::invalid_argument("to_ms is before from_ms"));
    }
    Ok((from, to))
}

fn status_from_error(err: anyhow::Error) -> Status {
    if let Some(transition) = err.downcast_ref::<AlertTransitionError>() {
        return match transition {
            AlertTransitionError::NotFound(_) => Status::not_found(transition.to_string()),
            AlertTransitionError::NotAllowed { .. } => {
                Status::failed_precondition(transition.to_string())
            }
            AlertTransitionError::MissingOperator => {
                Status::invalid_argument(transition.to_string())
            }
            AlertTransitionError::Database(_) => Status::unavailable(transition.to_string()),
        };
    }
    if err.downcast_ref::<TenantScopeError>().is_some() {
        return Status::unavailable(format!("tenant scope unavailable: {err}"));
    }
    Status::unavailable(err.to_string())
}

fn to_rpc_alert(alert: AlertRecord) -> RpcAlert {
    RpcAlert {
        id: alert.id.to_string(),
        rule_id: alert.rule_id.to_string(),
        rule_type: alert.rule_type,
        asset_code: alert.asset_code,
        sensor: alert.sensor,
        message: alert.message,
        status: alert.status,
        created_at_ms: alert.created_at.timestamp_millis(),
        updated_at_ms: alert.updated_at.timestamp_millis(),
        observed_value: alert.observed_value,
    }
}

fn to_rpc_point(point: SeriesPoint) -> ReadingPoint {
    ReadingPoint {
        timestamp_ms: point.ts.timestamp_millis(),
        value: point.value,
        min: point.min,
        max: point.max,
        samples: point.samples,
        provenance: point.provenance.unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl ConditionMonitor for MonitorRpc {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(self.to_health()))
    }

    async fn query_readings(
        &self,
        request: Request<QueryReadingsRequest>,
    ) -> Result<Response<QueryReadingsResponse>, Status> {
        let payload = request.into_inner();
        let asset_code = required(&payload.asset_code, "asset_code")?.to_string();
        let sensor = required(&payload.sensor, "sensor")?.to_string();
        let (from, to) = query_range(payload.from_ms, payload.to_ms, Utc::now())?;
        let tenant_id = self.tenant_id(&payload.tenant_slug).await?;

        let query = ReadingsQuery {
            tenant_id,
            asset_code,
            sensor,
            from,
            to,
            bucket_seconds: Some(payload.bucket_seconds).filter(|secs| *secs > 0),
            limit: Some(payload.limit).filter(|limit| *limit > 0),
        };
        let points = run_in_tenant_scope(&self.pool, tenant_id, move |scope| {
            Box::pin(async move { store::query_readings(scope.conn(), &query).await })
        })
        .await
        .map_err(status_from_error)?;

        Ok(Response::new(QueryReadingsResponse {
            points: points.into_iter().map(to_rpc_point).collect(),
        }))
    }

    async fn list_active_alerts(
        &self,
        request: Request<ListActiveAlertsRequest>,
    ) -> Result<Response<ListActiveAlertsResponse>, Status> {
        let payload = request.into_inner();
        let tenant_id = self.tenant_id(&payload.tenant_slug).await?;
        let alerts = run_in_tenant_scope(&self.pool, tenant_id, move |scope| {
            Box::pin(async move { store::list_active_alerts(scope.conn(), tenant_id).await })
        })
        .await
        .map_err(status_from_error)?;

        Ok(Response::new(ListActiveAlertsResponse {
            alerts: alerts.into_iter().map(to_rpc_alert).collect(),
        }))
    }

    async fn transition_alert(
        &self,
        request: Request<TransitionAlertRequest>,
    ) -> Result<Response<TransitionAlertResponse>, Status> {
        let payload = request.into_inner();
        let alert_id = Uuid::parse_str(payload.alert_id.trim())
            .map_err(|_| Status::invalid_argument("alert_id must be a UUID"))?;
        let transition = match AlertTarget::try_from(payload.target) {
            Ok(AlertTarget::Ack) => OperatorTransition::Ack,
            Ok(AlertTarget::Close) => OperatorTransition::Close,
            _ => return Err(Status::invalid_argument("target must be ACK or CLOSE")),
        };
        let operator = required(&payload.operator, "operator")?.to_string();
        let tenant_id = self.tenant_id(&payload.tenant_slug).await?;

        let alert = run_in_tenant_scope(&self.pool, tenant_id, move |scope| {
            Box::pin(async move {
                let alert = store::transition_alert(
                    scope.conn(),
                    tenant_id,
                    alert_id,
                    transition,
                    &operator,
                    Utc::now(),
                )
                .await?;
                Ok(alert)
            })
        })
        .await
        .map_err(status_from_error)?;

        tracing::info!(
            alert_id = %alert.id,
            status = %alert.status,
            "operator transitioned alert"
        );
        Ok(Response::new(TransitionAlertResponse {
            alert: Some(to_rpc_alert(alert)),
        }))
    }
}

pub async fn serve_uds(
    socket_path: &str,
    service: MonitorRpc,
    cancel: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<ConditionMonitorServer<MonitorRpc>>()
        .await;

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = %socket_path, "gRPC query service listening");

    Server::builder()
        .add_service(health_service)
        .add_service(ConditionMonitorServer::new(service))
        .serve_with_incoming_shutdown(incoming, async move { cancel.cancelled().await })
        .await?;

    tokio::fs::remove_file(socket_path).await.ok();
    Ok(())
}
