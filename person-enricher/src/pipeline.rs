use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::enrichment::{EnrichError, EnrichmentService};
use crate::error::{PipelineError, TransportError};
use crate::health::{ComponentStatus, HealthHandle, HealthRegistry};
use crate::metrics::{
    ENRICHMENT_FAILURES, ENRICHMENT_RETRIES, MESSAGES_COMMITTED, MESSAGES_DEAD_LETTERED,
    MESSAGES_FETCHED, MESSAGES_INVALID, PERSONS_CREATED, QUEUE_DEPTH,
};
use crate::retry::RetryPolicy;
use crate::transport::{QueueTransport, RawMessage};
use crate::types::PersonRequest;
use crate::validation::Validator;

/// Stages report at least this often, even when idle.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

const FETCH: &str = "fetch";
const DEAD_LETTER: &str = "dead_letter";
const DISPATCH: &str = "dispatch";
const COMMIT: &str = "commit";

type StageResult = Result<(), PipelineError>;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub drain_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub validator: Validator,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            drain_timeout: config.drain_timeout_ms.0,
            retry_policy: config.retry_policy(),
            validator: Validator::new(config.require_surname),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            drain_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            validator: Validator::default(),
        }
    }
}

/// The ingestion pipeline: fetch and validate, dead-letter the invalid,
/// enrich and persist the valid, commit whatever reached its terminal state.
///
/// Stages are connected by bounded queues and share one cancellation token.
/// The first stage to fail cancels the rest and its error is what `run`
/// returns. A message is committed only after it was persisted or
/// dead-lettered, and at most once.
pub struct Pipeline {
    transport: Arc<dyn QueueTransport>,
    service: Arc<dyn EnrichmentService>,
    settings: PipelineSettings,
    liveness: HealthRegistry,
}

impl Pipeline {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        service: Arc<dyn EnrichmentService>,
        settings: PipelineSettings,
        liveness: HealthRegistry,
    ) -> Self {
        Self {
            transport,
            service,
            settings,
            liveness,
        }
    }

    /// Runs until the transport closes, `shutdown` is cancelled, or a stage
    /// fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let token = shutdown.child_token();
        let capacity = self.settings.queue_capacity.max(1);

        let (valid_tx, valid_rx) = mpsc::channel(capacity);
        let (invalid_tx, invalid_rx) = mpsc::channel(capacity);
        let (commit_tx, commit_rx) = mpsc::channel(capacity);

        let mut stages = JoinSet::new();

        stages.spawn(fetch_stage(
            self.transport.clone(),
            self.settings.validator,
            valid_tx,
            invalid_tx.clone(),
            token.clone(),
            self.register(FETCH),
        ));
        stages.spawn(dispatch_stage(
            self.service.clone(),
            self.settings.retry_policy,
            valid_rx,
            invalid_tx,
            commit_tx.clone(),
            token.clone(),
            self.register(DISPATCH),
        ));
        stages.spawn(dead_letter_stage(
            self.transport.clone(),
            invalid_rx,
            commit_tx,
            token.clone(),
            self.register(DEAD_LETTER),
        ));
        stages.spawn(commit_stage(
            self.transport.clone(),
            commit_rx,
            token.clone(),
            self.register(COMMIT),
        ));

        info!(capacity, "pipeline started");
        let result = supervise(stages, token, self.settings.drain_timeout).await;
        match &result {
            Ok(()) => info!("pipeline stopped"),
            Err(e) => error!("pipeline failed: {}", e),
        }
        result
    }

    fn register(&self, stage: &str) -> HealthHandle {
        self.liveness
            .register(format!("pipeline_{stage}"), LIVENESS_DEADLINE)
    }
}

/// Waits for the stages. Once the token is cancelled, for any reason, the
/// remaining stages get `drain_timeout` to empty their queues before they
/// are aborted.
async fn supervise(
    mut stages: JoinSet<StageResult>,
    token: CancellationToken,
    drain_timeout: Duration,
) -> Result<(), PipelineError> {
    let mut first_error = None;

    loop {
        let joined = tokio::select! {
            joined = stages.join_next() => joined,
            _ = token.cancelled() => break,
        };
        let Some(joined) = joined else {
            return Ok(());
        };
        if let Some(error) = stage_error(joined) {
            first_error = Some(error);
            token.cancel();
            break;
        }
    }

    let drained = tokio::time::timeout(drain_timeout, async {
        while let Some(joined) = stages.join_next().await {
            if let Some(error) = stage_error(joined) {
                match first_error {
                    None => first_error = Some(error),
                    Some(_) => warn!("additional stage failure while draining: {}", error),
                }
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = stages.len(),
            "stages did not drain in {:?}, aborting", drain_timeout
        );
        stages.abort_all();
        while stages.join_next().await.is_some() {}
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn stage_error(joined: Result<StageResult, JoinError>) -> Option<PipelineError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(PipelineError::StagePanicked(e.to_string())),
    }
}

/// Cancels the siblings before handing the error to the supervisor, so that
/// stages tripping over the queues this one is about to drop know the
/// pipeline is going down.
fn fail(token: &CancellationToken, liveness: &HealthHandle, error: PipelineError) -> PipelineError {
    error!(stage = liveness.component(), "stage failed: {}", error);
    liveness.report_status(ComponentStatus::Unhealthy);
    token.cancel();
    error
}

/// Awaits `work`, reporting liveness while it is pending: a stage waiting on
/// a slow broker or a full queue is not stalled.
async fn reporting<F: Future>(liveness: &HealthHandle, work: F) -> F::Output {
    tokio::pin!(work);
    loop {
        liveness.report_healthy();
        tokio::select! {
            output = &mut work => return output,
            _ = tokio::time::sleep(LIVENESS_INTERVAL) => {}
        }
    }
}

/// Sends into a downstream queue, waiting for room. `Ok(false)` means the
/// receiver is gone because the pipeline is shutting down.
async fn forward<T>(
    queue: &mpsc::Sender<T>,
    item: T,
    token: &CancellationToken,
    liveness: &HealthHandle,
    stage: &'static str,
    name: &'static str,
) -> Result<bool, PipelineError> {
    if reporting(liveness, queue.send(item)).await.is_err() {
        if token.is_cancelled() {
            return Ok(false);
        }
        return Err(PipelineError::QueueClosed { stage, queue: name });
    }
    let depth = queue.max_capacity() - queue.capacity();
    metrics::gauge!(QUEUE_DEPTH, "queue" => name).set(depth as f64);
    Ok(true)
}

/// Receives from an upstream queue, reporting liveness while idle.
async fn next<T>(queue: &mut mpsc::Receiver<T>, liveness: &HealthHandle) -> Option<T> {
    loop {
        liveness.report_healthy();
        if let Ok(item) = tokio::time::timeout(LIVENESS_INTERVAL, queue.recv()).await {
            return item;
        }
    }
}

async fn fetch_stage(
    transport: Arc<dyn QueueTransport>,
    validator: Validator,
    valid: mpsc::Sender<(RawMessage, PersonRequest)>,
    invalid: mpsc::Sender<RawMessage>,
    token: CancellationToken,
    liveness: HealthHandle,
) -> StageResult {
    loop {
        let mut fetch = transport.fetch();
        let fetched = loop {
            liveness.report_healthy();
            tokio::select! {
                _ = token.cancelled() => {
                    info!("fetch stage stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(LIVENESS_INTERVAL) => continue,
                fetched = &mut fetch => break fetched,
            }
        };

        let mut message = match fetched {
            Ok(message) => message,
            Err(TransportError::Closed) => {
                info!("transport closed, fetch stage stopping");
                return Ok(());
            }
            Err(e) => return Err(fail(&token, &liveness, PipelineError::transport(FETCH, e))),
        };
        metrics::counter!(MESSAGES_FETCHED).increment(1);

        // A full queue blocks us here, which is the back-pressure we want
        let forwarded = match validator.validate(&message.payload) {
            Ok(request) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(false),
                    sent = forward(&valid, (message, request), &token, &liveness, FETCH, "valid") => sent,
                }
            }
            Err(reason) => {
                metrics::counter!(MESSAGES_INVALID).increment(1);
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    "invalid message: {}",
                    reason
                );
                message.annotate(reason.to_string());
                tokio::select! {
                    _ = token.cancelled() => Ok(false),
                    sent = forward(&invalid, message, &token, &liveness, FETCH, "invalid") => sent,
                }
            }
        };

        match forwarded {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => return Err(fail(&token, &liveness, e)),
        }
    }
}

async fn dead_letter_stage(
    transport: Arc<dyn QueueTransport>,
    mut invalid: mpsc::Receiver<RawMessage>,
    commit: mpsc::Sender<RawMessage>,
    token: CancellationToken,
    liveness: HealthHandle,
) -> StageResult {
    while let Some(message) = next(&mut invalid, &liveness).await {
        if let Err(e) = reporting(&liveness, transport.write_dead_letter(&message)).await {
            return Err(fail(&token, &liveness, PipelineError::transport(DEAD_LETTER, e)));
        }
        metrics::counter!(MESSAGES_DEAD_LETTERED).increment(1);

        match forward(&commit, message, &token, &liveness, DEAD_LETTER, "commit").await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => return Err(fail(&token, &liveness, e)),
        }
    }
    Ok(())
}

async fn commit_stage(
    transport: Arc<dyn QueueTransport>,
    mut commit: mpsc::Receiver<RawMessage>,
    token: CancellationToken,
    liveness: HealthHandle,
) -> StageResult {
    while let Some(message) = next(&mut commit, &liveness).await {
        if let Err(e) = reporting(&liveness, transport.commit(&message)).await {
            return Err(fail(&token, &liveness, PipelineError::transport(COMMIT, e)));
        }
        metrics::counter!(MESSAGES_COMMITTED).increment(1);
    }

    // Every upstream stage is gone, nothing else will be committed
    if let Err(e) = reporting(&liveness, transport.flush()).await {
        return Err(fail(&token, &liveness, PipelineError::transport(COMMIT, e)));
    }
    info!("commit stage flushed and stopping");
    Ok(())
}

enum Dispatched {
    Created(Uuid),
    Failed(EnrichError),
    /// Cancelled while backing off. The message stays uncommitted.
    Abandoned,
}

async fn dispatch_stage(
    service: Arc<dyn EnrichmentService>,
    retry_policy: RetryPolicy,
    mut valid: mpsc::Receiver<(RawMessage, PersonRequest)>,
    invalid: mpsc::Sender<RawMessage>,
    commit: mpsc::Sender<RawMessage>,
    token: CancellationToken,
    liveness: HealthHandle,
) -> StageResult {
    while let Some((mut message, request)) = next(&mut valid, &liveness).await {
        let dispatched = reporting(
            &liveness,
            create_person(&*service, &request, &retry_policy, &token),
        )
        .await;
        let forwarded = match dispatched {
            Dispatched::Created(id) => {
                metrics::counter!(PERSONS_CREATED).increment(1);
                debug!(%id, offset = message.offset, "person persisted");
                forward(&commit, message, &token, &liveness, DISPATCH, "commit").await
            }
            Dispatched::Failed(e) if e.is_fatal() => {
                return Err(fail(&token, &liveness, PipelineError::Enrichment(e)));
            }
            Dispatched::Failed(e) => {
                metrics::counter!(ENRICHMENT_FAILURES).increment(1);
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    "enrichment failed, dead-lettering: {}",
                    e
                );
                message.annotate(format!("enrichment failed: {e}"));
                forward(&invalid, message, &token, &liveness, DISPATCH, "invalid").await
            }
            Dispatched::Abandoned => {
                info!(
                    partition = message.partition,
                    offset = message.offset,
                    "shutting down, leaving message for redelivery"
                );
                continue;
            }
        };

        match forwarded {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => return Err(fail(&token, &liveness, e)),
        }
    }
    Ok(())
}

async fn create_person(
    service: &dyn EnrichmentService,
    request: &PersonRequest,
    retry_policy: &RetryPolicy,
    token: &CancellationToken,
) -> Dispatched {
    let mut attempt = 1;
    loop {
        let error = match service.create_person(request).await {
            Ok(id) => return Dispatched::Created(id),
            Err(e) => e,
        };
        if !error.is_retryable() || !retry_policy.should_retry(attempt) {
            return Dispatched::Failed(error);
        }

        let backoff = with_jitter(retry_policy.time_until_next_retry(attempt));
        metrics::counter!(ENRICHMENT_RETRIES).increment(1);
        warn!(
            attempt,
            "enrichment attempt failed, retrying in {:?}: {}", backoff, error
        );

        tokio::select! {
            _ = token.cancelled() => return Dispatched::Abandoned,
            _ = tokio::time::sleep(backoff) => {}
        }
        attempt += 1;
    }
}

/// Up to a quarter of the interval on top, so retries from several
/// consumers don't line up.
fn with_jitter(interval: Duration) -> Duration {
    let quarter = u64::try_from(interval.as_millis() / 4).unwrap_or(u64::MAX);
    if quarter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}
