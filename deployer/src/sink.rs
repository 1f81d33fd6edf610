use std::sync::Arc;

use modelbay_common::log::LogSink;

/// Build the optional structured event sink.
///
/// Initialization is best-effort: no broker configured, a build without the
/// `kafka` feature, or a failed producer construction all degrade to running
/// without a sink.
pub fn init(broker: Option<&str>, topic: &str) -> Option<Arc<dyn LogSink>> {
    let broker = broker?;
    build(broker, topic)
}

#[cfg(feature = "kafka")]
fn build(broker: &str, topic: &str) -> Option<Arc<dyn LogSink>> {
    match kafka::KafkaSink::new(broker, topic) {
        Ok(sink) => {
            tracing::info!(%broker, %topic, "event sink initialized");
            Some(Arc::new(sink))
        }
        Err(error) => {
            tracing::warn!(%broker, %error, "could not initialize event sink");
            None
        }
    }
}

#[cfg(not(feature = "kafka"))]
fn build(broker: &str, topic: &str) -> Option<Arc<dyn LogSink>> {
    let _ = topic;
    tracing::warn!(%broker, "built without the kafka feature; event sink disabled");
    None
}

#[cfg(feature = "kafka")]
mod kafka {
    use std::time::Duration;

    use async_trait::async_trait;
    use modelbay_common::log::{LogSink, Record};
    use rdkafka::config::ClientConfig;
    use rdkafka::error::KafkaError;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    pub struct KafkaSink {
        producer: FutureProducer,
        topic: String,
    }

    impl KafkaSink {
        pub fn new(broker: &str, topic: &str) -> Result<Self, KafkaError> {
            let producer = ClientConfig::new()
                .set("bootstrap.servers", broker)
                .set("message.timeout.ms", "5000")
                .create()?;

            Ok(Self {
                producer,
                topic: topic.to_string(),
            })
        }
    }

    #[async_trait]
    impl LogSink for KafkaSink {
        async fn emit(&self, record: Record) {
            let Ok(payload) = serde_json::to_string(&record) else {
                return;
            };

            let delivery = self
                .producer
                .send(
                    FutureRecord::to(&self.topic)
                        .key(&record.server)
                        .payload(&payload),
                    Duration::from_secs(5),
                )
                .await;

            if let Err((error, _)) = delivery {
                tracing::warn!(%error, "failed to emit record to event sink");
            }
        }
    }
}
