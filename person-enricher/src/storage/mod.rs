pub mod cache;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ChangeSpec, FilterSpec, PersonRecord};

pub use cache::{CachedStorage, NoopPersonCache, PersonCache, RedisPersonCache};
pub use postgres::PostgresStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("person {0} not found")]
    NotFound(Uuid),
    #[error("no changes requested")]
    NoChanges,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable person storage.
#[async_trait]
pub trait PersonStorage: Send + Sync {
    async fn create(&self, person: &PersonRecord) -> StorageResult<()>;

    async fn get_by_id(&self, id: Uuid) -> StorageResult<Option<PersonRecord>>;

    /// One page of persons matching every present field of `filter`,
    /// ordered by name. Pages start at 0.
    async fn get_with_filter(
        &self,
        filter: &FilterSpec,
        page: u32,
    ) -> StorageResult<Vec<PersonRecord>>;

    /// Fails with `NotFound` when there is no such person.
    async fn delete_by_id(&self, id: Uuid) -> StorageResult<()>;

    /// Fails with `NoChanges` for an empty change set, `NotFound` when there
    /// is no such person.
    async fn change_by_id(&self, id: Uuid, changes: &ChangeSpec) -> StorageResult<()>;

    async fn migrate(&self) -> StorageResult<()>;
}
