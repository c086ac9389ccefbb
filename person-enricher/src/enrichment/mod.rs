pub mod lookups;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics::{ENRICHMENT_DURATION, LOOKUP_REQUESTS};
use crate::storage::{PersonStorage, StorageError};
use crate::types::{Gender, PersonRecord, PersonRequest};

pub use lookups::{build_http_client, AgifyClient, GenderizeClient, NationalizeClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Age,
    Gender,
    Nationality,
}

impl Attribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Age => "age",
            Attribute::Gender => "gender",
            Attribute::Nationality => "nationality",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("no confident answer")]
    NoAnswer,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code {0}")]
    Status(u16),
}

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("{attribute} not enrichable")]
    NotEnrichable { attribute: Attribute },
    #[error("{attribute} lookup failed: {source}")]
    Lookup {
        attribute: Attribute,
        #[source]
        source: LookupError,
    },
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl EnrichError {
    fn from_lookup(attribute: Attribute, error: LookupError) -> Self {
        match error {
            LookupError::NoAnswer => EnrichError::NotEnrichable { attribute },
            source => EnrichError::Lookup { attribute, source },
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnrichError::Lookup { .. } | EnrichError::Storage(_))
    }

    /// Failures that would hit every following record as well.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EnrichError::Storage(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgeLookup: Send + Sync {
    async fn age(&self, name: &str) -> Result<i32, LookupError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenderLookup: Send + Sync {
    async fn gender(&self, name: &str) -> Result<Gender, LookupError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NationalityLookup: Send + Sync {
    async fn nationality(&self, name: &str) -> Result<String, LookupError>;
}

/// What the ingestion pipeline hands valid requests to.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    /// Enrich and persist, returning the id of the new person.
    async fn create_person(&self, request: &PersonRequest) -> Result<Uuid, EnrichError>;
}

pub struct EnrichmentOrchestrator {
    age: Arc<dyn AgeLookup>,
    gender: Arc<dyn GenderLookup>,
    nationality: Arc<dyn NationalityLookup>,
    storage: Arc<dyn PersonStorage>,
}

fn record_lookup<T>(attribute: Attribute, result: &Result<T, LookupError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(LookupError::NoAnswer) => "no_answer",
        Err(_) => "error",
    };
    metrics::counter!(LOOKUP_REQUESTS, "attribute" => attribute.as_str(), "outcome" => outcome)
        .increment(1);
}

impl EnrichmentOrchestrator {
    pub fn new(
        age: Arc<dyn AgeLookup>,
        gender: Arc<dyn GenderLookup>,
        nationality: Arc<dyn NationalityLookup>,
        storage: Arc<dyn PersonStorage>,
    ) -> Self {
        Self {
            age,
            gender,
            nationality,
            storage,
        }
    }

    /// Runs the three lookups concurrently. The first hard failure wins and
    /// nothing partial is ever returned.
    pub async fn enrich(&self, request: &PersonRequest) -> Result<PersonRecord, EnrichError> {
        let started = Instant::now();
        let name = request.name.as_str();

        let age = async {
            let result = self.age.age(name).await;
            record_lookup(Attribute::Age, &result);
            result.map_err(|e| EnrichError::from_lookup(Attribute::Age, e))
        };
        let gender = async {
            let result = self.gender.gender(name).await;
            record_lookup(Attribute::Gender, &result);
            result.map_err(|e| EnrichError::from_lookup(Attribute::Gender, e))
        };
        let nationality = async {
            let result = self.nationality.nationality(name).await;
            record_lookup(Attribute::Nationality, &result);
            result.map_err(|e| EnrichError::from_lookup(Attribute::Nationality, e))
        };

        let (age, gender, nationality) = tokio::try_join!(age, gender, nationality)?;

        metrics::histogram!(ENRICHMENT_DURATION).record(started.elapsed().as_secs_f64());
        debug!(name, age, %gender, nationality, "person enriched");

        Ok(PersonRecord {
            id: Uuid::now_v7(),
            name: request.name.clone(),
            surname: request.surname.clone(),
            patronymic: request.patronymic.clone(),
            age,
            gender,
            nationality,
        })
    }
}

#[async_trait]
impl EnrichmentService for EnrichmentOrchestrator {
    async fn create_person(&self, request: &PersonRequest) -> Result<Uuid, EnrichError> {
        let person = self.enrich(request).await?;
        self.storage.create(&person).await?;

        info!(id = %person.id, name = person.name, "person created");
        Ok(person.id)
    }
}
