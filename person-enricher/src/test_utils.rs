//! In-memory stand-ins for the broker, the lookups and the stores, shared by
//! the unit tests and the integration tests under `tests/`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tracing::warn;
use uuid::Uuid;

use crate::enrichment::{
    AgeLookup, EnrichError, EnrichmentOrchestrator, EnrichmentService, GenderLookup, LookupError,
    NationalityLookup,
};
use crate::error::TransportError;
use crate::kafka::offsets::OffsetTracker;
use crate::kafka::transport::commit_error;
use crate::storage::cache::{CacheError, PersonCache};
use crate::storage::{PersonStorage, StorageError, StorageResult};
use crate::transport::{QueueTransport, RawMessage};
use crate::types::{ChangeSpec, FilterSpec, Gender, PersonRecord, PersonRequest};

const MEMORY_PAGE_SIZE: usize = 5;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn person_record(name: &str, surname: &str) -> PersonRecord {
    PersonRecord {
        id: Uuid::now_v7(),
        name: name.to_owned(),
        surname: surname.to_owned(),
        patronymic: None,
        age: 30,
        gender: Gender::Female,
        nationality: "US".to_owned(),
    }
}

/// A single-partition topic backed by a channel.
///
/// `fetch` reports `Closed` once `close` was called and every pushed message
/// was handed out. Dead letters and commits are recorded for inspection.
pub struct MemoryTransport {
    topic: String,
    input: Mutex<Option<mpsc::UnboundedSender<RawMessage>>>,
    output: AsyncMutex<mpsc::UnboundedReceiver<RawMessage>>,
    next_offset: AtomicUsize,
    fetched: AtomicUsize,
    offsets: OffsetTracker,
    dead_letters: Mutex<Vec<Vec<u8>>>,
    committed: Mutex<Vec<i64>>,
    fail_dead_letters: AtomicBool,
    fail_commits: AtomicBool,
    flushes: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(topic: &str) -> Self {
        let (input, output) = mpsc::unbounded_channel();
        Self {
            topic: topic.to_owned(),
            input: Mutex::new(Some(input)),
            output: AsyncMutex::new(output),
            next_offset: AtomicUsize::new(0),
            fetched: AtomicUsize::new(0),
            offsets: OffsetTracker::new(),
            dead_letters: Mutex::default(),
            committed: Mutex::default(),
            fail_dead_letters: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
        }
    }

    /// A transport that serves `payloads` in order, then reports `Closed`.
    pub fn with_messages<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let transport = Self::new("FIO");
        for payload in payloads {
            transport.push(payload);
        }
        transport.close();
        transport
    }

    /// Queue a message, returning its offset.
    pub fn push(&self, payload: &[u8]) -> i64 {
        let offset = i64::try_from(self.next_offset.fetch_add(1, Ordering::SeqCst))
            .unwrap_or(i64::MAX);
        self.send(offset, payload);
        offset
    }

    /// Queue another copy of an earlier message, as the broker does after a
    /// rebalance or a lost commit.
    pub fn redeliver(&self, offset: i64, payload: &[u8]) {
        self.send(offset, payload);
    }

    fn send(&self, offset: i64, payload: &[u8]) {
        match lock(&self.input).as_ref() {
            Some(input) => {
                if input
                    .send(RawMessage::new(&self.topic, 0, offset, payload.to_vec()))
                    .is_err()
                {
                    warn!(offset, "memory transport receiver is gone");
                }
            }
            None => warn!(offset, "push after close is ignored"),
        }
    }

    pub fn close(&self) {
        lock(&self.input).take();
    }

    pub fn fail_dead_letters(&self, fail: bool) {
        self.fail_dead_letters.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        lock(&self.dead_letters).clone()
    }

    /// Offsets of committed messages, in commit order, once per commit call.
    pub fn committed(&self) -> Vec<i64> {
        lock(&self.committed).clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn fetch(&self) -> Result<RawMessage, TransportError> {
        let message = self
            .output
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;

        self.offsets
            .track(&message.topic, message.partition, message.offset);
        self.fetched.fetch_add(1, Ordering::SeqCst);
        Ok(message)
    }

    async fn write_dead_letter(&self, message: &RawMessage) -> Result<(), TransportError> {
        if self.fail_dead_letters.load(Ordering::SeqCst) {
            return Err(TransportError::DeadLetter {
                topic: format!("{}_FAILED", self.topic),
                error: KafkaError::MessageProduction(RDKafkaErrorCode::BrokerNotAvailable),
            });
        }
        lock(&self.dead_letters).push(message.dead_letter_payload());
        Ok(())
    }

    async fn commit(&self, message: &RawMessage) -> Result<(), TransportError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(TransportError::CommitFailed(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::CoordinatorNotAvailable,
            )));
        }
        self.offsets
            .complete(&message.topic, message.partition, message.offset)
            .map_err(|e| commit_error(e, message))?;
        lock(&self.committed).push(message.offset);
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StubAnswer {
    Known {
        age: i32,
        gender: Gender,
        nationality: String,
    },
    NoAnswer,
    Unavailable,
}

/// Canned answers for all three lookups.
pub struct StubLookups {
    answer: StubAnswer,
    calls: AtomicUsize,
}

impl StubLookups {
    pub fn new(age: i32, gender: Gender, nationality: &str) -> Self {
        Self::with_answer(StubAnswer::Known {
            age,
            gender,
            nationality: nationality.to_owned(),
        })
    }

    /// Every lookup comes back without a confident answer.
    pub fn not_enrichable() -> Self {
        Self::with_answer(StubAnswer::NoAnswer)
    }

    /// Every lookup fails with a 503.
    pub fn unavailable() -> Self {
        Self::with_answer(StubAnswer::Unavailable)
    }

    fn with_answer(answer: StubAnswer) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of age lookups, i.e. enrichment attempts.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer<T>(&self, pick: impl FnOnce(&i32, &Gender, &String) -> T) -> Result<T, LookupError> {
        match &self.answer {
            StubAnswer::Known {
                age,
                gender,
                nationality,
            } => Ok(pick(age, gender, nationality)),
            StubAnswer::NoAnswer => Err(LookupError::NoAnswer),
            StubAnswer::Unavailable => Err(LookupError::Status(503)),
        }
    }
}

#[async_trait]
impl AgeLookup for StubLookups {
    async fn age(&self, _name: &str) -> Result<i32, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer(|age, _, _| *age)
    }
}

#[async_trait]
impl GenderLookup for StubLookups {
    async fn gender(&self, _name: &str) -> Result<Gender, LookupError> {
        self.answer(|_, gender, _| *gender)
    }
}

#[async_trait]
impl NationalityLookup for StubLookups {
    async fn nationality(&self, _name: &str) -> Result<String, LookupError> {
        self.answer(|_, _, nationality| nationality.clone())
    }
}

pub fn stub_orchestrator(
    lookups: Arc<StubLookups>,
    storage: Arc<dyn PersonStorage>,
) -> EnrichmentOrchestrator {
    EnrichmentOrchestrator::new(lookups.clone(), lookups.clone(), lookups, storage)
}

/// An EnrichmentService that records requests and optionally waits for a
/// permit before answering, to hold messages in flight.
pub struct StubService {
    requests: Mutex<Vec<PersonRequest>>,
    gate: Option<Semaphore>,
}

impl StubService {
    pub fn new() -> Self {
        Self {
            requests: Mutex::default(),
            gate: None,
        }
    }

    /// Every call blocks until `release` hands out a permit for it.
    pub fn gated() -> Self {
        Self {
            requests: Mutex::default(),
            gate: Some(Semaphore::new(0)),
        }
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn requests(&self) -> Vec<PersonRequest> {
        lock(&self.requests).clone()
    }
}

impl Default for StubService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnrichmentService for StubService {
    async fn create_person(&self, request: &PersonRequest) -> Result<Uuid, EnrichError> {
        lock(&self.requests).push(request.clone());
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        Ok(Uuid::now_v7())
    }
}

/// A durable store in a HashMap, counting the calls that matter to the
/// cache-aside tests.
#[derive(Default)]
pub struct MemoryStorage {
    persons: Mutex<HashMap<Uuid, PersonRecord>>,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn persons(&self) -> Vec<PersonRecord> {
        lock(&self.persons).values().cloned().collect()
    }

    /// Every call fails as if the database were unreachable.
    pub fn fail_with_database_errors(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

fn matches_filter(person: &PersonRecord, filter: &FilterSpec) -> bool {
    filter.id.map_or(true, |id| person.id == id)
        && filter.name.as_ref().map_or(true, |n| &person.name == n)
        && filter.surname.as_ref().map_or(true, |s| &person.surname == s)
        && filter
            .patronymic
            .as_ref()
            .map_or(true, |p| person.patronymic.as_ref() == Some(p))
        && filter
            .age
            .map_or(true, |r| (r.min..=r.max).contains(&person.age))
        && filter.gender.map_or(true, |g| person.gender == g)
        && filter
            .nationality
            .as_ref()
            .map_or(true, |n| &person.nationality == n)
}

#[async_trait]
impl PersonStorage for MemoryStorage {
    async fn create(&self, person: &PersonRecord) -> StorageResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        lock(&self.persons).insert(person.id, person.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StorageResult<Option<PersonRecord>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(lock(&self.persons).get(&id).cloned())
    }

    async fn get_with_filter(
        &self,
        filter: &FilterSpec,
        page: u32,
    ) -> StorageResult<Vec<PersonRecord>> {
        self.check()?;
        let mut matching: Vec<_> = lock(&self.persons)
            .values()
            .filter(|p| matches_filter(p, filter))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));

        let skip = usize::try_from(page).unwrap_or(usize::MAX).saturating_mul(MEMORY_PAGE_SIZE);
        Ok(matching
            .into_iter()
            .skip(skip)
            .take(MEMORY_PAGE_SIZE)
            .collect())
    }

    async fn delete_by_id(&self, id: Uuid) -> StorageResult<()> {
        self.check()?;
        lock(&self.persons)
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id))
    }

    async fn change_by_id(&self, id: Uuid, changes: &ChangeSpec) -> StorageResult<()> {
        if changes.is_empty() {
            return Err(StorageError::NoChanges);
        }
        self.check()?;

        let mut persons = lock(&self.persons);
        let person = persons.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if let Some(name) = &changes.name {
            person.name = name.clone();
        }
        if let Some(surname) = &changes.surname {
            person.surname = surname.clone();
        }
        if let Some(patronymic) = &changes.patronymic {
            person.patronymic = patronymic.clone();
        }
        if let Some(age) = changes.age {
            person.age = age;
        }
        if let Some(gender) = changes.gender {
            person.gender = gender;
        }
        if let Some(nationality) = &changes.nationality {
            person.nationality = nationality.clone();
        }
        Ok(())
    }

    async fn migrate(&self) -> StorageResult<()> {
        self.check()
    }
}

#[derive(Default)]
pub struct MemoryCache {
    persons: Mutex<HashMap<Uuid, PersonRecord>>,
}

impl MemoryCache {
    pub fn len(&self) -> usize {
        lock(&self.persons).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersonCache for MemoryCache {
    async fn get(&self, id: Uuid) -> Result<Option<PersonRecord>, CacheError> {
        Ok(lock(&self.persons).get(&id).cloned())
    }

    async fn set(&self, person: &PersonRecord) -> Result<(), CacheError> {
        lock(&self.persons).insert(person.id, person.clone());
        Ok(())
    }

    async fn invalidate(&self, id: Uuid) -> Result<(), CacheError> {
        lock(&self.persons).remove(&id);
        Ok(())
    }
}
