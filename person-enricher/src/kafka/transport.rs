use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::TransportError;
use crate::health::HealthHandle;
use crate::kafka::offsets::{OffsetTracker, OffsetTrackerError};
use crate::metrics::KAFKA_COMMIT_ERRORS;
use crate::transport::{QueueTransport, RawMessage};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
/// How long past `message.timeout.ms` a dead-letter delivery may take
/// before it is given up.
const DELIVERY_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on a single dead-letter write.
pub(crate) fn delivery_backstop(config: &KafkaConfig) -> Duration {
    Duration::from_millis(config.kafka_message_timeout_ms.into()) + DELIVERY_GRACE
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // The rdkafka main loop is running and calling us
        self.liveness.report_healthy();
    }
}

/// Consumer side context: owns the offset bookkeeping, which rebalances and
/// commit results feed into.
pub struct TrackingContext {
    liveness: HealthHandle,
    offsets: OffsetTracker,
    commit_failure: Mutex<Option<KafkaError>>,
}

impl TrackingContext {
    pub fn new(liveness: HealthHandle) -> Self {
        Self {
            liveness,
            offsets: OffsetTracker::new(),
            commit_failure: Mutex::new(None),
        }
    }

    pub fn offsets(&self) -> &OffsetTracker {
        &self.offsets
    }

    /// The first commit the broker rejected since the last call, if any.
    pub fn take_commit_failure(&self) -> Option<KafkaError> {
        self.commit_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl ClientContext for TrackingContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for TrackingContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends these on every membership change
                if partitions.count() == 0 {
                    debug!("skipping empty revoke rebalance");
                    return;
                }
                info!("revoking {} partitions", partitions.count());
                for partition in partitions.elements() {
                    self.offsets.revoke(partition.topic(), partition.partition());
                }
            }
            Rebalance::Assign(partitions) => {
                debug!("pre-rebalance assign of {} partitions", partitions.count());
            }
            Rebalance::Error(e) => error!("rebalance error: {}", e),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() > 0 {
                info!("assigned {} partitions", partitions.count());
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let error = match result {
            Ok(_) => {
                debug!("committed offsets for {} partitions", offsets.count());
                return;
            }
            Err(error) => error,
        };
        metrics::counter!(KAFKA_COMMIT_ERRORS).increment(1);

        let owned = offsets
            .elements()
            .iter()
            .any(|p| !self.offsets.is_revoked(p.topic(), p.partition()));
        if !owned {
            // Raced the revocation; the new owner carries on from the last commit
            warn!("failed to commit offsets of revoked partitions: {}", error);
            return;
        }

        error!("failed to commit offsets: {}", error);
        self.commit_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert(error);
    }
}

/// Reads the input topic and writes the dead-letter topic.
///
/// Offsets are committed explicitly, and only up to the lowest message that
/// has not reached its terminal state yet. Commits go out asynchronously; a
/// rejected one fails the next `commit` or the final `flush`.
pub struct KafkaTransport {
    consumer: StreamConsumer<TrackingContext>,
    producer: FutureProducer<KafkaContext>,
    dead_letter_topic: String,
    /// Backstop on top of the producer's own `message.timeout.ms`.
    delivery_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let mut common = ClientConfig::new();
        common
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if config.kafka_tls {
            common
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let mut consumer_config = common.clone();
        consumer_config
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset);

        let mut producer_config = common;
        producer_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec);

        debug!("rdkafka consumer configuration: {:?}", consumer_config);
        let consumer: StreamConsumer<TrackingContext> =
            consumer_config.create_with_context(TrackingContext::new(liveness.clone()))?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        debug!("rdkafka producer configuration: {:?}", producer_config);
        let producer: FutureProducer<KafkaContext> =
            producer_config.create_with_context(liveness.into())?;

        // "Ping" the brokers so a bad address fails at startup, not on the first dead letter
        match producer.client().fetch_metadata(None, METADATA_TIMEOUT) {
            Ok(metadata) => info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            ),
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {
            consumer,
            producer,
            dead_letter_topic: config.kafka_dead_letter_topic.clone(),
            delivery_timeout: delivery_backstop(config),
        })
    }

    fn offsets(&self) -> &OffsetTracker {
        self.consumer.context().offsets()
    }

    fn check_commit_failure(&self) -> Result<(), TransportError> {
        match self.consumer.context().take_commit_failure() {
            Some(error) => Err(TransportError::CommitFailed(error)),
            None => Ok(()),
        }
    }

    /// Messages fetched but not committed yet.
    pub fn in_flight(&self) -> usize {
        self.offsets().in_flight()
    }
}

#[async_trait]
impl QueueTransport for KafkaTransport {
    async fn fetch(&self) -> Result<RawMessage, TransportError> {
        let message = self.consumer.recv().await?;

        let raw = RawMessage::new(
            message.topic(),
            message.partition(),
            message.offset(),
            // An empty payload fails validation like any other malformed record
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        );
        self.offsets().track(&raw.topic, raw.partition, raw.offset);

        Ok(raw)
    }

    async fn write_dead_letter(&self, message: &RawMessage) -> Result<(), TransportError> {
        let payload = message.dead_letter_payload();
        let record = FutureRecord::<(), [u8]>::to(&self.dead_letter_topic).payload(&payload);

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((error, _)) => {
                return Err(TransportError::DeadLetter {
                    topic: self.dead_letter_topic.clone(),
                    error,
                })
            }
        };

        // The producer gives up after message.timeout.ms; this is only a backstop
        match tokio::time::timeout(self.delivery_timeout, delivery).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err((error, _)))) => Err(TransportError::DeadLetter {
                topic: self.dead_letter_topic.clone(),
                error,
            }),
            Ok(Err(_)) | Err(_) => Err(TransportError::DeadLetterCanceled {
                topic: self.dead_letter_topic.clone(),
            }),
        }
    }

    async fn commit(&self, message: &RawMessage) -> Result<(), TransportError> {
        self.check_commit_failure()?;

        let position = match self
            .offsets()
            .complete(&message.topic, message.partition, message.offset)
        {
            Ok(Some(position)) => position,
            Ok(None) => return Ok(()),
            Err(e) => return Err(commit_error(e, message)),
        };

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(position),
        )?;
        self.consumer
            .commit(&assignment, CommitMode::Async)
            .map_err(TransportError::CommitFailed)
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.check_commit_failure()?;

        let positions = self.offsets().positions();
        if positions.is_empty() {
            return Ok(());
        }

        let mut assignment = TopicPartitionList::new();
        for (topic, partition, position) in &positions {
            assignment.add_partition_offset(topic, *partition, Offset::Offset(*position))?;
        }
        // Blocks until the broker answered, so nothing is lost when the consumer closes
        self.consumer
            .commit(&assignment, CommitMode::Sync)
            .map_err(TransportError::CommitFailed)?;

        info!("flushed commit positions for {} partitions", positions.len());
        Ok(())
    }
}

pub(crate) fn commit_error(error: OffsetTrackerError, message: &RawMessage) -> TransportError {
    match error {
        OffsetTrackerError::Untracked(offset) => TransportError::UnknownOffset {
            topic: message.topic.clone(),
            partition: message.partition,
            offset,
        },
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaErrorCode, RDKafkaRespErr};

    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::*;
    use crate::config::Config;
    use crate::health::HealthRegistry;
    use crate::pipeline::LIVENESS_DEADLINE;

    fn start_on_mocked_brokers() -> (MockCluster<'static, DefaultProducerContext>, KafkaTransport)
    {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("FIO_FAILED", 1, 1)
            .expect("failed to create dead letter topic");

        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_owned(),
            kafka_consumer_group: "person-enricher-test".to_owned(),
            kafka_consumer_topic: "FIO".to_owned(),
            kafka_dead_letter_topic: "FIO_FAILED".to_owned(),
            kafka_consumer_offset_reset: "earliest".to_owned(),
        };
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("rdkafka", Duration::from_secs(30));
        let transport = KafkaTransport::new(&config, handle).expect("failed to create transport");

        (cluster, transport)
    }

    #[test]
    fn default_dead_letter_backstop_fits_the_stage_deadline() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        let backstop = delivery_backstop(&config.kafka);

        assert_eq!(backstop, Duration::from_secs(25));
        assert!(backstop < LIVENESS_DEADLINE);
    }

    #[tokio::test]
    async fn dead_letter_write_errors_are_surfaced() {
        let (cluster, transport) = start_on_mocked_brokers();
        let mut message = RawMessage::new("FIO", 0, 3, br#"{"name":""}"#.to_vec());
        message.annotate("name required");

        // Wait for the producer to be healthy, to keep the message timeout short
        let mut delivered = false;
        for _ in 0..20 {
            if transport.write_dead_letter(&message).await.is_ok() {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "failed to write an initial dead letter");

        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match transport.write_dead_letter(&message).await {
            Err(TransportError::DeadLetter { topic, .. }) => assert_eq!(topic, "FIO_FAILED"),
            Err(err) => panic!("wrong error {}", err),
            Ok(()) => panic!("should have errored"),
        }
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
    }

    #[tokio::test]
    async fn repeated_commits_are_ignored_and_unknown_offsets_refused() {
        let (_cluster, transport) = start_on_mocked_brokers();

        let unknown = RawMessage::new("FIO", 0, 9, Vec::new());
        assert!(matches!(
            transport.commit(&unknown).await,
            Err(TransportError::UnknownOffset { offset: 9, .. })
        ));

        // Offset 0 stays in flight, so finishing 1 does not reach the broker
        transport.offsets().track("FIO", 0, 0);
        transport.offsets().track("FIO", 0, 1);
        let second = RawMessage::new("FIO", 0, 1, Vec::new());
        transport.commit(&second).await.unwrap();
        assert_eq!(transport.in_flight(), 1);

        // A redelivered copy finishing as well
        transport.commit(&second).await.unwrap();
        assert_eq!(transport.in_flight(), 1);
    }

    #[tokio::test]
    async fn rejected_async_commit_fails_the_next_commit_and_flush() {
        let (_cluster, transport) = start_on_mocked_brokers();
        transport.offsets().track("FIO", 0, 0);
        transport.offsets().track("FIO", 0, 1);

        let mut rejected = TopicPartitionList::new();
        rejected
            .add_partition_offset("FIO", 0, Offset::Offset(1))
            .unwrap();
        let context = transport.consumer.context();
        context.commit_callback(
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::UnknownMemberId)),
            &rejected,
        );

        let second = RawMessage::new("FIO", 0, 1, Vec::new());
        assert!(matches!(
            transport.commit(&second).await,
            Err(TransportError::CommitFailed(_))
        ));

        context.commit_callback(
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::UnknownMemberId)),
            &rejected,
        );
        assert!(matches!(
            transport.flush().await,
            Err(TransportError::CommitFailed(_))
        ));
    }

    #[test]
    fn commit_failures_of_revoked_partitions_are_not_fatal() {
        let registry = HealthRegistry::new("liveness");
        let context = TrackingContext::new(registry.register("rdkafka", Duration::from_secs(30)));
        context.offsets().track("FIO", 3, 10);

        let mut list = TopicPartitionList::new();
        list.add_partition_offset("FIO", 3, Offset::Offset(11))
            .unwrap();

        context.offsets().revoke("FIO", 3);
        context.commit_callback(
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress)),
            &list,
        );
        assert!(context.take_commit_failure().is_none());

        context.offsets().track("FIO", 3, 12);
        context.commit_callback(
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress)),
            &list,
        );
        assert!(context.take_commit_failure().is_some());
        assert!(context.take_commit_failure().is_none());
    }

    #[tokio::test]
    async fn flush_without_fetched_messages_is_a_no_op() {
        let (_cluster, transport) = start_on_mocked_brokers();
        transport.flush().await.unwrap();
    }
}
