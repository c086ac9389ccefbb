use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::enrichment::EnrichError;

/// Errors from the queue transport. None of these are retried by the
/// transport itself: they end the pipeline run.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("dead letter delivery to {topic} failed: {error}")]
    DeadLetter { topic: String, error: KafkaError },
    #[error("dead letter delivery to {topic} was canceled")]
    DeadLetterCanceled { topic: String },
    #[error("offset commit failed: {0}")]
    CommitFailed(KafkaError),
    #[error("offset {offset} on {topic}/{partition} was never fetched")]
    UnknownOffset {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

/// Errors that end a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{stage} stage: {source}")]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[error("dispatch stage: {0}")]
    Enrichment(#[source] EnrichError),
    #[error("{stage} stage: downstream queue {queue} closed")]
    QueueClosed {
        stage: &'static str,
        queue: &'static str,
    },
    #[error("pipeline stage panicked: {0}")]
    StagePanicked(String),
}

impl PipelineError {
    pub fn transport(stage: &'static str, source: TransportError) -> Self {
        PipelineError::Transport { stage, source }
    }
}
