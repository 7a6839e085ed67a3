mod evaluate;
mod ingestor;


use crate::alert_feed::AlertFeed;
use crate::pipeline::IngestStats;
use crate::timestamp::TimestampMode;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnparseableTopic,
    UnsupportedChannel(String),
    UnknownTenant(String),
    UnknownDevice(String),
    IngestKeyMismatch(String),
    UndecodablePayload(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::UnparseableTopic => f.write_str("unparseable topic"),
            DropReason::UnsupportedChannel(channel) => write!(f, "unsupported channel `{channel}`"),
            DropReason::UnknownTenant(slug) => write!(f, "unknown tenant `{slug}`"),
            DropReason::UnknownDevice(code) => write!(f, "unknown device `{code}`"),
            DropReason::IngestKeyMismatch(code) => write!(f, "ingest key rejected for `{code}`"),
            DropReason::UndecodablePayload(err) => write!(f, "undecodable payload: {err}"),
        }
    }
}

/// How a message left the ingest path. Every outcome is acknowledged to the transport; errors and
/// timeouts leave the message unacknowledged and ask the listener to have it redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Persisted { readings: usize },
    StateRecorded,
    Dropped(DropReason),
}

/// Shared, stateless half of message processing. Rate-of-change windows live in the per-worker
/// [`crate::rules::RuleEngine`] passed into [`Ingestor::process`].
#[derive(Clone)]
pub struct Ingestor {
    pool: PgPool,
    stats: Arc<IngestStats>,
    timestamp_mode: TimestampMode,
    alert_feed: Option<AlertFeed>,
}

impl Ingestor {
    pub fn new(
        pool: PgPool,
        stats: Arc<IngestStats>,
        timestamp_mode: TimestampMode,
        alert_feed: Option<AlertFeed>,
    ) -> Self {
        Self {
            pool,
            stats,
            timestamp_mode,
            alert_feed,
        }
    }
}
