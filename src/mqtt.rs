use crate::config::Config;
use crate::ingest::InboundMessage;
use crate::pipeline::{Dispatcher, IngestStats, Job};
use crate::topic::subscription_filter;
use anyhow::Result;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish, QoS,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_FLUSH: Duration = Duration::from_secs(2);
const REDELIVERY_BACKOFF: Duration = Duration::from_secs(5);

/// Requests from workers to the listener that owns the broker session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Handled; acknowledge on the session that delivered it.
    Ack { session: u64, publish: Publish },
    /// Left unacknowledged; the session must be re-established for the broker to resend it.
    Redeliver { session: u64 },
}

pub fn channel() -> (
    mpsc::UnboundedSender<SessionCommand>,
    mpsc::UnboundedReceiver<SessionCommand>,
) {
    mpsc::unbounded_channel()
}

/// Settles one delivery once its message is handled.
pub struct DeliveryAck {
    commands: mpsc::UnboundedSender<SessionCommand>,
    session: u64,
    publish: Publish,
}

impl DeliveryAck {
    pub fn new(
        commands: mpsc::UnboundedSender<SessionCommand>,
        session: u64,
        publish: Publish,
    ) -> Self {
        Self {
            commands,
            session,
            publish,
        }
    }

    pub fn ack(self) {
        let command = SessionCommand::Ack {
            session: self.session,
            publish: self.publish,
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(session = self.session, "MQTT session closed; acknowledgement lost");
        }
    }

    pub fn redeliver(self) {
        let command = SessionCommand::Redeliver {
            session: self.session,
        };
        if self.commands.send(command).is_err() {
            tracing::debug!(session = self.session, "MQTT session closed; broker will redeliver");
        }
    }
}

impl fmt::Debug for DeliveryAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryAck")
            .field("session", &self.session)
            .field("topic", &self.publish.topic)
            .field("pkid", &self.publish.pkid)
            .finish()
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    // Persistent session plus manual acks: anything not acknowledged is redelivered by the broker.
    options.set_clean_session(false);
    options.set_manual_acks(true);
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub options: MqttOptions,
    pub request_capacity: usize,
    pub redelivery_backoff: Duration,
}

impl ListenerSettings {
    pub fn from_config(config: &Config) -> Self {
        // Room for an ack per message that can be queued or in flight across the workers.
        let request_capacity = config
            .worker_count
            .max(1)
            .saturating_mul(config.worker_queue.max(1) + 1)
            .saturating_add(16);
        Self {
            options: mqtt_options(config),
            request_capacity,
            redelivery_backoff: REDELIVERY_BACKOFF,
        }
    }
}

enum Step {
    Event(Result<Event, ConnectionError>),
    Command(SessionCommand),
    StopIntake,
    Redeliver,
    Disconnect,
}

enum SessionEnd {
    Shutdown,
    Redeliver,
    Dropped(ConnectionError),
}

/// Receives deliveries and hands them to the workers until `disconnect` fires.
///
/// Cancelling `stop_intake` stops dispatching while the session stays up, so acknowledgements from
/// draining workers still reach the broker. Acks still queued when `disconnect` fires are flushed
/// before the DISCONNECT packet goes out.
pub async fn run_listener(
    settings: ListenerSettings,
    dispatcher: Dispatcher,
    stats: Arc<IngestStats>,
    stop_intake: CancellationToken,
    disconnect: CancellationToken,
) -> Result<()> {
    let filter = subscription_filter();
    let (commands_tx, mut commands) = channel();
    let mut dispatcher = Some(dispatcher);
    let mut session: u64 = 0;

    loop {
        session += 1;
        let (client, mut eventloop) =
            AsyncClient::new(settings.options.clone(), settings.request_capacity);

        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "failed to subscribe to MQTT; retrying");
            tokio::select! {
                _ = disconnect.cancelled() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => continue,
            }
        }

        let redeliver_at = Instant::now() + settings.redelivery_backoff;
        let mut redeliver_pending = false;

        let end = loop {
            let step = tokio::select! {
                biased;
                _ = disconnect.cancelled() => Step::Disconnect,
                _ = stop_intake.cancelled(), if dispatcher.is_some() => Step::StopIntake,
                Some(command) = commands.recv() => Step::Command(command),
                _ = sleep_until(redeliver_at), if redeliver_pending && dispatcher.is_some() => {
                    Step::Redeliver
                }
                event = eventloop.poll() => Step::Event(event),
            };

            match step {
                Step::Disconnect => break SessionEnd::Shutdown,
                Step::Redeliver => break SessionEnd::Redeliver,
                Step::StopIntake => {
                    dispatcher = None;
                    tracing::info!("MQTT intake stopped; settling in-flight deliveries");
                }
                Step::Command(command) => {
                    if apply_command(&client, session, command) {
                        redeliver_pending = true;
                    }
                }
                Step::Event(Ok(Event::Incoming(Incoming::ConnAck(_)))) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(topic = %filter, session, "connected to MQTT broker");
                }
                Step::Event(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    IngestStats::incr(&stats.received);
                    let Some(dispatcher) = dispatcher.as_ref() else {
                        tracing::debug!(topic = %publish.topic, "intake stopped; leaving delivery to the broker");
                        continue;
                    };
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };
                    let job = Job {
                        message,
                        ack: Some(DeliveryAck::new(commands_tx.clone(), session, publish)),
                    };
                    if let Err(err) = dispatcher.dispatch(job).await {
                        tracing::warn!(error = %err, "failed to dispatch MQTT message");
                    }
                }
                Step::Event(Ok(_)) => {}
                Step::Event(Err(err)) => break SessionEnd::Dropped(err),
            }
        };

        stats.set_mqtt_connected(false);
        match end {
            SessionEnd::Shutdown => {
                let flushed = close_session(&client, &mut eventloop, session, &mut commands).await;
                tracing::info!(acks_flushed = flushed, "MQTT listener stopped");
                return Ok(());
            }
            SessionEnd::Redeliver => {
                close_session(&client, &mut eventloop, session, &mut commands).await;
                tracing::info!(session, "reconnecting MQTT session to redeliver unacknowledged messages");
            }
            SessionEnd::Dropped(err) => {
                tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                tokio::select! {
                    _ = disconnect.cancelled() => return Ok(()),
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

/// Applies one worker command to the live session. Returns true when a redelivery was requested.
fn apply_command(client: &AsyncClient, session: u64, command: SessionCommand) -> bool {
    match command {
        SessionCommand::Ack {
            session: delivered_on,
            publish,
        } => {
            // The broker resends unacknowledged messages after a reconnect; a stale pkid must not
            // be acknowledged on the new session.
            if delivered_on != session {
                tracing::debug!(pkid = publish.pkid, delivered_on, session, "dropping ack from earlier session");
                return false;
            }
            if let Err(err) = client.try_ack(&publish) {
                tracing::warn!(error = %err, topic = %publish.topic, "failed to acknowledge MQTT delivery");
            }
            false
        }
        SessionCommand::Redeliver { session: delivered_on } => delivered_on == session,
    }
}

/// Forwards every queued ack for `session` to the client without waiting.
fn flush_pending_acks(
    client: &AsyncClient,
    session: u64,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> usize {
    let mut flushed = 0;
    while let Ok(command) = commands.try_recv() {
        if matches!(&command, SessionCommand::Ack { session: s, .. } if *s == session) {
            flushed += 1;
        }
        apply_command(client, session, command);
    }
    flushed
}

/// Flushes queued acks, then polls until the DISCONNECT packet is written. Requests are written in
/// order, so every ack queued before it has reached the broker.
async fn close_session(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    session: u64,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> usize {
    let flushed = flush_pending_acks(client, session, commands);
    if let Err(err) = client.try_disconnect() {
        tracing::debug!(error = %err, "MQTT disconnect request failed");
        return flushed;
    }
    let drained = timeout(DISCONNECT_FLUSH, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "MQTT connection closed while disconnecting");
                    break;
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(timeout = ?DISCONNECT_FLUSH, "MQTT disconnect did not complete in time");
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Ingestor;
    use crate::pipeline::{WorkerOptions, WorkerPool};
    use crate::rules::AlertPolicy;
    use crate::timestamp::TimestampMode;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 1;
    const PUBACK: u8 = 4;
    const SUBSCRIBE: u8 = 8;
    const PINGREQ: u8 = 12;
    const DISCONNECT: u8 = 14;

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await?;
        Ok((header >> 4, body))
    }

    fn publish_packet(pkid: u16, topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + 2 + payload.len();
        assert!(remaining < 128);
        let mut packet = vec![0x32, remaining as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(&pkid.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Accepts one client, completes CONNECT and SUBSCRIBE, then delivers `publishes` at QoS 1.
    async fn accept_session(
        broker: &TcpListener,
        publishes: &[(u16, &str)],
    ) -> std::io::Result<TcpStream> {
        let (mut stream, _) = broker.accept().await?;
        let (kind, _) = read_packet(&mut stream).await?;
        assert_eq!(kind, CONNECT);
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;
        let (kind, body) = read_packet(&mut stream).await?;
        assert_eq!(kind, SUBSCRIBE);
        stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await?;
        for (pkid, topic) in publishes {
            stream.write_all(&publish_packet(*pkid, topic, b"{}")).await?;
        }
        Ok(stream)
    }

    /// PUBACK packet ids read before the client's DISCONNECT.
    async fn acks_until_disconnect(stream: &mut TcpStream) -> std::io::Result<Vec<u16>> {
        let mut acked = Vec::new();
        loop {
            let (kind, body) = read_packet(stream).await?;
            match kind {
                PUBACK => acked.push(u16::from_be_bytes([body[0], body[1]])),
                PINGREQ => stream.write_all(&[0xd0, 0x00]).await?,
                DISCONNECT => return Ok(acked),
                _ => {}
            }
        }
    }

    fn settings(port: u16) -> ListenerSettings {
        let mut options = MqttOptions::new("condmon-test", "127.0.0.1", port);
        options.set_clean_session(false);
        options.set_manual_acks(true);
        ListenerSettings {
            options,
            request_capacity: 16,
            redelivery_backoff: Duration::from_millis(100),
        }
    }

    fn worker_pool(stats: Arc<IngestStats>) -> Result<WorkerPool> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://monitor@127.0.0.1:1/unreachable")?;
        let ingestor = Ingestor::new(pool, stats.clone(), TimestampMode::Auto, None);
        let options = WorkerOptions {
            workers: 2,
            queue: 4,
            message_timeout: Duration::from_secs(2),
            window_idle_ttl: Duration::from_secs(60),
            policy: AlertPolicy::default(),
        };
        Ok(WorkerPool::start(ingestor, options, stats))
    }

    async fn wait_for(stats: &IngestStats, received: u64) {
        for _ in 0..500 {
            if stats.received.load(Ordering::Relaxed) >= received {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("listener never received {received} messages");
    }

    #[tokio::test]
    async fn drained_deliveries_are_acknowledged_before_disconnect() -> Result<()> {
        let broker = TcpListener::bind("127.0.0.1:0").await?;
        let port = broker.local_addr()?.port();
        let broker_task = tokio::spawn(async move {
            let mut stream =
                accept_session(&broker, &[(7, "tenants/acme/bogus"), (8, "not-a-device")]).await?;
            acks_until_disconnect(&mut stream).await
        });

        let stats = Arc::new(IngestStats::new());
        let workers = worker_pool(stats.clone())?;
        let stop_intake = CancellationToken::new();
        let disconnect = CancellationToken::new();
        let listener = tokio::spawn(run_listener(
            settings(port),
            workers.dispatcher(),
            stats.clone(),
            stop_intake.clone(),
            disconnect.clone(),
        ));

        wait_for(&stats, 2).await;
        stop_intake.cancel();
        workers.shutdown(Duration::from_secs(5)).await;
        disconnect.cancel();
        listener.await??;

        let mut acked = broker_task.await??;
        acked.sort_unstable();
        assert_eq!(acked, vec![7, 8]);
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 2);
        assert!(!stats.mqtt_connected.load(Ordering::Relaxed));
        Ok(())
    }

    #[tokio::test]
    async fn failed_delivery_reconnects_session_without_ack() -> Result<()> {
        let broker = TcpListener::bind("127.0.0.1:0").await?;
        let port = broker.local_addr()?.port();
        let broker_task = tokio::spawn(async move {
            let mut first = accept_session(
                &broker,
                &[(3, "tenants/acme/devices/pump-001/telemetry")],
            )
            .await?;
            let acked = acks_until_disconnect(&mut first).await?;
            let _second = accept_session(&broker, &[]).await?;
            Ok::<_, std::io::Error>(acked)
        });

        let stats = Arc::new(IngestStats::new());
        let workers = worker_pool(stats.clone())?;
        let stop_intake = CancellationToken::new();
        let disconnect = CancellationToken::new();
        let listener = tokio::spawn(run_listener(
            settings(port),
            workers.dispatcher(),
            stats.clone(),
            stop_intake.clone(),
            disconnect.clone(),
        ));

        let acked = tokio::time::timeout(Duration::from_secs(10), broker_task).await???;
        assert!(acked.is_empty());
        assert_eq!(
            stats.failures.load(Ordering::Relaxed) + stats.timeouts.load(Ordering::Relaxed),
            1
        );

        stop_intake.cancel();
        workers.shutdown(Duration::from_secs(5)).await;
        disconnect.cancel();
        listener.await??;
        Ok(())
    }

    #[tokio::test]
    async fn pending_acks_flush_only_for_live_session() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("t", "localhost", 1883), 16);
        let (tx, mut rx) = channel();
        for pkid in 1..=3 {
            let mut publish = Publish::new("tenants/acme/devices/d1/telemetry", QoS::AtLeastOnce, "{}");
            publish.pkid = pkid;
            DeliveryAck::new(tx.clone(), 2, publish).ack();
        }
        DeliveryAck::new(tx.clone(), 1, Publish::new("stale", QoS::AtLeastOnce, "{}")).ack();
        DeliveryAck::new(tx, 2, Publish::new("failed", QoS::AtLeastOnce, "{}")).redeliver();

        assert_eq!(flush_pending_acks(&client, 2, &mut rx), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn redelivery_is_requested_only_for_live_session() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("t", "localhost", 1883), 4);
        assert!(apply_command(&client, 2, SessionCommand::Redeliver { session: 2 }));
        assert!(!apply_command(&client, 2, SessionCommand::Redeliver { session: 1 }));
    }
}
