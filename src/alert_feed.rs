use crate::config::Config;
use crate::store::AlertRecord;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

const TOKEN_HEADER: &str = "X-Alert-Feed-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertTransition {
    Opened,
    Closed,
}

impl AlertTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertTransition::Opened => "opened",
            AlertTransition::Closed => "closed",
        }
    }
}

/// Outbound notification of an engine-driven alert change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertFeedItem {
    pub transition: AlertTransition,
    pub alert_id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Uuid,
    pub rule_type: String,
    pub asset_code: String,
    pub sensor: String,
    pub message: String,
    pub status: String,
    pub observed_value: f64,
    pub at: DateTime<Utc>,
}

impl AlertFeedItem {
    pub fn new(transition: AlertTransition, alert: &AlertRecord) -> Self {
        Self {
            transition,
            alert_id: alert.id,
            tenant_id: alert.tenant_id,
            rule_id: alert.rule_id,
            rule_type: alert.rule_type.clone(),
            asset_code: alert.asset_code.clone(),
            sensor: alert.sensor.clone(),
            message: alert.message.clone(),
            status: alert.status.clone(),
            observed_value: alert.observed_value,
            at: alert.updated_at,
        }
    }
}

#[derive(Serialize)]
struct AlertFeedPayload<'a> {
    items: &'a [AlertFeedItem],
}

#[derive(Clone)]
pub struct AlertFeed {
    tx: mpsc::Sender<AlertFeedItem>,
}

impl AlertFeed {
    /// Starts the background publisher when a feed URL is configured.
    pub fn start(config: &Config) -> Option<(Self, JoinHandle<()>)> {
        let url = config
            .alert_feed_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())?
            .to_string();
        let (tx, rx) = mpsc::channel(config.alert_feed_queue.max(1));
        let token = config.alert_feed_token.clone();
        let batch_size = config.alert_feed_batch_size.max(1);
        let flush_interval = config.alert_feed_flush_interval();

        let handle = tokio::spawn(async move {
            run_alert_feed(rx, url, token, batch_size, flush_interval).await;
        });

        Some((Self { tx }, handle))
    }

    pub fn enqueue(&self, item: AlertFeedItem) {
        if let Err(err) = self.tx.try_send(item) {
            tracing::warn!(error = %err, "alert feed queue full; dropping transition");
        }
    }
}

async fn run_alert_feed(
    mut rx: mpsc::Receiver<AlertFeedItem>,
    url: String,
    token: Option<String>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let client = Client::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer: Vec<AlertFeedItem> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = flush_alert_feed(&client, &url, token.as_deref(), &mut buffer).await {
                    tracing::warn!(error = %err, "alert feed flush failed");
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= batch_size {
                            if let Err(err) = flush_alert_feed(&client, &url, token.as_deref(), &mut buffer).await {
                                tracing::warn!(error = %err, "alert feed flush failed");
                            }
                        }
                    }
                    None => {
                        if let Err(err) = flush_alert_feed(&client, &url, token.as_deref(), &mut buffer).await {
                            tracing::warn!(error = %err, "alert feed final flush failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

async fn flush_alert_feed(
    client: &Client,
    url: &str,
    token: Option<&str>,
    buffer: &mut Vec<AlertFeedItem>,
) -> Result<(), reqwest::Error> {
    if buffer.is_empty() {
        return Ok(());
    }

    let items: Vec<AlertFeedItem> = std::mem::take(buffer);
    let mut request = client.post(url).json(&AlertFeedPayload { items: &items });
    if let Some(token) = token {
        request = request.header(TOKEN_HEADER, token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        tracing::warn!(status = %response.status(), items = items.len(), "alert feed returned non-success");
    }
    Ok(())
}
