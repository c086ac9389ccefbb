use std::sync::Arc;

use async_trait::async_trait;
use redis::RedisError;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::{PersonStorage, StorageResult};
use crate::metrics::{CACHE_ERRORS, CACHE_LOOKUPS};
use crate::types::{ChangeSpec, FilterSpec, PersonRecord};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("failed to encode cached person: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fast lookup of persons by id. Never the source of truth: callers treat
/// every error as a miss.
#[async_trait]
pub trait PersonCache: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<PersonRecord>, CacheError>;
    async fn set(&self, person: &PersonRecord) -> Result<(), CacheError>;
    async fn invalidate(&self, id: Uuid) -> Result<(), CacheError>;
}

fn cache_key(id: Uuid) -> String {
    format!("person:{id}")
}

#[async_trait]
pub trait RedisClientOperations: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RedisError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> Result<(), RedisError>;
    async fn del(&self, key: &str) -> Result<(), RedisError>;
}

#[derive(Clone)]
pub struct RedisCacheClient {
    conn: redis::aio::ConnectionManager,
}

impl RedisCacheClient {
    pub async fn new(client: redis::Client) -> Result<Self, RedisError> {
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RedisClientOperations for RedisCacheClient {
    async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET").arg(key).query_async(&mut conn).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// JSON-encoded persons under `person:{id}`, expiring after `ttl` seconds.
pub struct RedisPersonCache<T: RedisClientOperations = RedisCacheClient> {
    client: T,
    ttl: u64,
}

impl<T: RedisClientOperations> RedisPersonCache<T> {
    pub fn new(client: T, ttl: u64) -> Self {
        Self { client, ttl }
    }
}

impl RedisPersonCache<RedisCacheClient> {
    pub async fn new_redis(client: redis::Client, ttl: u64) -> Result<Self, RedisError> {
        let redis_client = RedisCacheClient::new(client).await?;
        Ok(Self::new(redis_client, ttl))
    }
}

#[async_trait]
impl<T: RedisClientOperations> PersonCache for RedisPersonCache<T> {
    async fn get(&self, id: Uuid) -> Result<Option<PersonRecord>, CacheError> {
        let Some(value) = self.client.get(&cache_key(id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&value) {
            Ok(person) => Ok(Some(person)),
            Err(e) => {
                // Written by an incompatible version, or corrupted. The store has the truth.
                warn!(%id, "ignoring undecodable cached person: {}", e);
                Ok(None)
            }
        }
    }

    async fn set(&self, person: &PersonRecord) -> Result<(), CacheError> {
        let value = serde_json::to_string(person)?;
        self.client
            .set_ex(&cache_key(person.id), &value, self.ttl)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, id: Uuid) -> Result<(), CacheError> {
        self.client.del(&cache_key(id)).await?;
        Ok(())
    }
}

/// Used when caching is disabled: every lookup misses.
pub struct NoopPersonCache;

#[async_trait]
impl PersonCache for NoopPersonCache {
    async fn get(&self, _id: Uuid) -> Result<Option<PersonRecord>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _person: &PersonRecord) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _id: Uuid) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Cache-aside wrapper around a durable store.
///
/// Reads by id go to the cache first and fill it on a miss. Writes go to the
/// store, then the cache; deletes and changes drop the cached entry before
/// touching the store. Store errors propagate, cache errors are logged and
/// otherwise ignored.
pub struct CachedStorage<S, C>
where
    S: PersonStorage,
    C: PersonCache,
{
    inner: Arc<S>,
    cache: Arc<C>,
}

impl<S, C> CachedStorage<S, C>
where
    S: PersonStorage,
    C: PersonCache,
{
    pub fn new(inner: Arc<S>, cache: Arc<C>) -> Self {
        Self { inner, cache }
    }

    async fn populate(&self, person: &PersonRecord) {
        if let Err(e) = self.cache.set(person).await {
            metrics::counter!(CACHE_ERRORS, "operation" => "set").increment(1);
            warn!(id = %person.id, "failed to populate person cache: {}", e);
        }
    }

    async fn invalidate(&self, id: Uuid) {
        if let Err(e) = self.cache.invalidate(id).await {
            metrics::counter!(CACHE_ERRORS, "operation" => "invalidate").increment(1);
            warn!(%id, "failed to invalidate cached person: {}", e);
        }
    }
}

#[async_trait]
impl<S, C> PersonStorage for CachedStorage<S, C>
where
    S: PersonStorage + 'static,
    C: PersonCache + 'static,
{
    async fn create(&self, person: &PersonRecord) -> StorageResult<()> {
        self.inner.create(person).await?;
        self.populate(person).await;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StorageResult<Option<PersonRecord>> {
        match self.cache.get(id).await {
            Ok(Some(person)) => {
                metrics::counter!(CACHE_LOOKUPS, "result" => "hit").increment(1);
                return Ok(Some(person));
            }
            Ok(None) => metrics::counter!(CACHE_LOOKUPS, "result" => "miss").increment(1),
            Err(e) => {
                metrics::counter!(CACHE_LOOKUPS, "result" => "error").increment(1);
                warn!(%id, "person cache lookup failed, reading from store: {}", e);
            }
        }

        let person = self.inner.get_by_id(id).await?;
        if let Some(person) = &person {
            self.populate(person).await;
        }
        Ok(person)
    }

    async fn get_with_filter(
        &self,
        filter: &FilterSpec,
        page: u32,
    ) -> StorageResult<Vec<PersonRecord>> {
        self.inner.get_with_filter(filter, page).await
    }

    async fn delete_by_id(&self, id: Uuid) -> StorageResult<()> {
        self.invalidate(id).await;
        self.inner.delete_by_id(id).await
    }

    async fn change_by_id(&self, id: Uuid, changes: &ChangeSpec) -> StorageResult<()> {
        self.invalidate(id).await;
        self.inner.change_by_id(id, changes).await
    }

    async fn migrate(&self) -> StorageResult<()> {
        self.inner.migrate().await
    }
}

#[cfg(test)]
mod tests {
    use mockall::mock;
    use mockall::predicate::eq;

    use super::*;
    use crate::storage::StorageError;
    use crate::test_utils::{person_record, MemoryCache, MemoryStorage};
    use crate::types::Gender;

    mock! {
        pub RedisClient {}

        #[async_trait::async_trait]
        impl RedisClientOperations for RedisClient {
            async fn get(&self, key: &str) -> Result<Option<String>, RedisError>;
            async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> Result<(), RedisError>;
            async fn del(&self, key: &str) -> Result<(), RedisError>;
        }
    }

    fn redis_down() -> RedisError {
        RedisError::from((redis::ErrorKind::IoError, "connection refused"))
    }

    #[tokio::test]
    async fn redis_cache_writes_json_with_ttl() {
        let person = person_record("Alice", "Smith");
        let key = format!("person:{}", person.id);
        let expected = serde_json::to_string(&person).unwrap();

        let mut client = MockRedisClient::new();
        client
            .expect_set_ex()
            .with(eq(key), eq(expected), eq(300))
            .times(1)
            .returning(|_, _, _| Ok(()));

        RedisPersonCache::new(client, 300).set(&person).await.unwrap();
    }

    #[tokio::test]
    async fn redis_cache_decodes_hits() {
        let person = person_record("Alice", "Smith");
        let cached = serde_json::to_string(&person).unwrap();

        let mut client = MockRedisClient::new();
        client
            .expect_get()
            .with(eq(format!("person:{}", person.id)))
            .returning(move |_| Ok(Some(cached.clone())));

        let cache = RedisPersonCache::new(client, 300);
        assert_eq!(cache.get(person.id).await.unwrap(), Some(person));
    }

    #[tokio::test]
    async fn redis_cache_treats_garbage_as_miss() {
        let mut client = MockRedisClient::new();
        client
            .expect_get()
            .returning(|_| Ok(Some("{not json".to_owned())));

        let cache = RedisPersonCache::new(client, 300);
        assert_eq!(cache.get(Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_then_get_is_served_from_cache() {
        let store = Arc::new(MemoryStorage::default());
        let cache = Arc::new(MemoryCache::default());
        let storage = CachedStorage::new(store.clone(), cache.clone());
        let person = person_record("Alice", "Smith");

        storage.create(&person).await.unwrap();
        assert_eq!(storage.get_by_id(person.id).await.unwrap(), Some(person));

        assert_eq!(store.get_calls(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn miss_reads_store_and_fills_cache() {
        let store = Arc::new(MemoryStorage::default());
        let cache = Arc::new(MemoryCache::default());
        let person = person_record("Ivan", "Petrov");
        store.create(&person).await.unwrap();

        let storage = CachedStorage::new(store.clone(), cache.clone());
        assert_eq!(storage.get_by_id(person.id).await.unwrap(), Some(person.clone()));
        assert_eq!(storage.get_by_id(person.id).await.unwrap(), Some(person));

        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn absent_person_is_not_cached() {
        let store = Arc::new(MemoryStorage::default());
        let cache = Arc::new(MemoryCache::default());
        let storage = CachedStorage::new(store, cache.clone());

        assert_eq!(storage.get_by_id(Uuid::now_v7()).await.unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn delete_leaves_no_stale_entry() {
        let store = Arc::new(MemoryStorage::default());
        let cache = Arc::new(MemoryCache::default());
        let storage = CachedStorage::new(store, cache.clone());
        let person = person_record("Alice", "Smith");

        storage.create(&person).await.unwrap();
        storage.delete_by_id(person.id).await.unwrap();

        assert_eq!(storage.get_by_id(person.id).await.unwrap(), None);
        assert_eq!(cache.len(), 0);
        assert!(matches!(
            storage.delete_by_id(person.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn change_is_visible_through_cache() {
        let store = Arc::new(MemoryStorage::default());
        let cache = Arc::new(MemoryCache::default());
        let storage = CachedStorage::new(store, cache);
        let person = person_record("Alice", "Smith");
        storage.create(&person).await.unwrap();

        let changes = ChangeSpec {
            gender: Some(Gender::Male),
            ..Default::default()
        };
        storage.change_by_id(person.id, &changes).await.unwrap();

        let changed = storage.get_by_id(person.id).await.unwrap().unwrap();
        assert_eq!(changed.gender, Gender::Male);
    }

    #[tokio::test]
    async fn cache_failures_degrade_to_store() {
        let mut client = MockRedisClient::new();
        client.expect_get().returning(|_| Err(redis_down()));
        client.expect_set_ex().returning(|_, _, _| Err(redis_down()));
        client.expect_del().returning(|_| Err(redis_down()));

        let store = Arc::new(MemoryStorage::default());
        let storage = CachedStorage::new(store.clone(), Arc::new(RedisPersonCache::new(client, 300)));
        let person = person_record("Alice", "Smith");

        storage.create(&person).await.unwrap();
        assert_eq!(storage.get_by_id(person.id).await.unwrap(), Some(person.clone()));
        assert_eq!(store.get_calls(), 1);
        storage.delete_by_id(person.id).await.unwrap();
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let store = Arc::new(MemoryStorage::default());
        store.fail_with_database_errors(true);
        let storage = CachedStorage::new(store, Arc::new(NoopPersonCache));

        let result = storage.create(&person_record("Alice", "Smith")).await;
        assert!(matches!(result, Err(StorageError::Database(_))));
    }
}
