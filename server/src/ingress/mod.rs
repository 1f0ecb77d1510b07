//! Event-bus ingress: consumes platform topics and turns each event into
//! hub dispatch calls.
//!
//! One consumer task per topic, sharing a consumer group. Offsets are
//! committed after the handler returns, even on handler error, so a
//! malformed event cannot stall its topic. Fetch errors pause a second and
//! retry.

pub mod handlers;

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use tokio::task::JoinHandle;

use crate::cluster::Fanout;
use crate::config::Config;
use crate::protocol::ProtocolError;

pub const TOPIC_SUBMISSION_CREATED: &str = "submission.created";
pub const TOPIC_SUBMISSION_JUDGED: &str = "submission.judged";
pub const TOPIC_LEADERBOARD_UPDATED: &str = "leaderboard.updated";
pub const TOPIC_CONTEST_STARTED: &str = "contest.started";
pub const TOPIC_CONTEST_ENDED: &str = "contest.ended";

const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("malformed event payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to build client envelope: {0}")]
    Encode(#[from] ProtocolError),

    #[error("no handler registered for topic {0}")]
    UnknownTopic(String),
}

/// Create one consumer per configured topic and start its task. A failure
/// to build or subscribe any consumer is fatal to startup.
pub fn spawn_consumers(config: &Config, fanout: Fanout) -> Result<Vec<JoinHandle<()>>, KafkaError> {
    let topics = config.kafka_topic_list();
    let mut handles = Vec::with_capacity(topics.len());

    for topic in topics {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.kafka_consumer_group)
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .create()?;
        consumer.subscribe(&[topic.as_str()])?;

        let fanout = fanout.clone();
        handles.push(tokio::spawn(consume_topic(consumer, topic, fanout)));
    }

    tracing::info!(topics = handles.len(), "event bus consumers started");
    Ok(handles)
}

async fn consume_topic(consumer: StreamConsumer, topic: String, fanout: Fanout) {
    tracing::info!(topic = %topic, "starting consumer for topic");

    loop {
        match consumer.recv().await {
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "failed to fetch message");
                tokio::time::sleep(FETCH_RETRY_DELAY).await;
            }
            Ok(message) => {
                tracing::debug!(
                    topic = %topic,
                    partition = message.partition(),
                    offset = message.offset(),
                    "received message"
                );

                let payload = message.payload().unwrap_or_default();
                if let Err(e) = handlers::dispatch(&topic, payload, &fanout).await {
                    tracing::error!(topic = %topic, error = %e, "event handler failed");
                }

                // Committed regardless of handler outcome: a poison message
                // must not stall the topic.
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::error!(topic = %topic, error = %e, "failed to commit offset");
                }
            }
        }
    }
}
