use crate::config::Config;
use crate::ingest::Ingestor;
use crate::pipeline::{spawn_worker, BatchCommand, PipelineHandle};
use crate::record::RawMessage;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Acknowledgement token for one MQTT publish. Acks are only valid on the connection that
/// received the publish, so the token remembers which session that was.
#[derive(Debug, Clone)]
pub struct Delivery {
    session: u64,
    publish: Publish,
}

/// Capacity of the client's request channel. Acks beyond it wait in the consumer's backlog.
const CLIENT_REQUEST_CAPACITY: usize = 32;

pub struct ConsumerTasks {
    pub consumer: JoinHandle<()>,
    pub worker: JoinHandle<()>,
}

/// Starts consumer `index` and its batch worker.
pub fn spawn_consumer(config: &Config, index: usize, ingestor: Ingestor) -> ConsumerTasks {
    let stats = ingestor.stats();
    let (tx, rx) = mpsc::channel::<BatchCommand<Delivery>>(config.max_queue.max(1));
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    let pipeline = PipelineHandle::new(tx, stats);
    let worker = spawn_worker(
        ingestor,
        rx,
        config.batch_size,
        config.flush_interval(),
        Some(ack_tx),
    );

    let config = config.clone();
    let consumer = tokio::spawn(async move {
        if let Err(err) = run_consumer(config, index, pipeline, ack_rx).await {
            tracing::error!(error=%err, worker = index, "metrics consumer stopped");
        }
    });
    ConsumerTasks { consumer, worker }
}

pub async fn run_consumer(
    config: Config,
    index: usize,
    pipeline: PipelineHandle<Delivery>,
    mut ack_rx: mpsc::UnboundedReceiver<Delivery>,
) -> Result<()> {
    let topic = config.subscription_topic();
    let client_id = format!("{}-{}", config.mqtt_client_id, index);
    let stats = pipeline.stats();
    let mut session: u64 = 0;

    loop {
        session += 1;
        let mut mqttoptions =
            MqttOptions::new(client_id.clone(), config.mqtt_host.clone(), config.mqtt_port);
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        mqttoptions.set_manual_acks(true);
        mqttoptions.set_clean_session(false);
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, CLIENT_REQUEST_CAPACITY);
        let mut unacked: VecDeque<Publish> = VecDeque::new();
        match client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            Ok(_) => {
                tracing::info!(topic=%topic, worker = index, "subscribed to app metrics feed");
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        stats.set_stream_connected(true);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let message = RawMessage::new(publish.topic.clone(), publish.payload.clone())
                            .with_offset(None, Some(i64::from(publish.pkid)));
                        if let Err(err) = pipeline.enqueue(message, Delivery { session, publish }).await {
                            tracing::warn!(error=%err, "batch worker gone; stopping consumer");
                            return Ok(());
                        }
                    }
                    Ok(Event::Outgoing(_)) => send_acks(&client, &mut unacked),
                    Ok(_) => {}
                    Err(err) => {
                        stats.set_stream_connected(false);
                        tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                        break;
                    }
                },
                Some(delivery) = ack_rx.recv() => {
                    if delivery.session != session {
                        tracing::trace!(pkid = delivery.publish.pkid, "dropping ack from a previous session");
                        continue;
                    }
                    unacked.push_back(delivery.publish);
                    send_acks(&client, &mut unacked);
                }
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
}

/// Hands queued acks to the client without waiting. The request channel is only drained by
/// `eventloop.poll()`, so a full channel leaves the rest queued for the next outgoing event.
fn send_acks(client: &AsyncClient, unacked: &mut VecDeque<Publish>) {
    while let Some(publish) = unacked.front() {
        if client.try_ack(publish).is_err() {
            tracing::trace!(backlog = unacked.len(), "MQTT request channel full; deferring acks");
            return;
        }
        unacked.pop_front();
    }
}
