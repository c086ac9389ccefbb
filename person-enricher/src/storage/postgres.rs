use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use super::{PersonStorage, StorageError, StorageResult};
use crate::types::{ChangeSpec, FilterSpec, Gender, PersonRecord};

const DB_QUERY_DURATION: &str = "person_enricher_db_query_duration_seconds";

const SELECT_PERSON: &str =
    "SELECT id, name, surname, patronymic, age, gender, nationality FROM person";

/// Postgres implementation of PersonStorage
pub struct PostgresStorage {
    pool: PgPool,
    page_size: u32,
}

impl PostgresStorage {
    pub fn new(pool: PgPool, page_size: u32) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct PersonRow {
    id: Uuid,
    name: String,
    surname: String,
    patronymic: Option<String>,
    age: i32,
    gender: String,
    nationality: String,
}

impl From<PersonRow> for PersonRecord {
    fn from(row: PersonRow) -> Self {
        PersonRecord {
            id: row.id,
            name: row.name,
            surname: row.surname,
            patronymic: row.patronymic,
            age: row.age,
            gender: row.gender.parse().unwrap_or(Gender::Unknown),
            nationality: row.nationality,
        }
    }
}

fn observe(operation: &'static str, started: Instant) {
    metrics::histogram!(DB_QUERY_DURATION, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Appends `WHERE` for the first condition and `AND` for the rest.
struct Conditions {
    any: bool,
}

impl Conditions {
    fn next<'a, 'args>(
        &mut self,
        qb: &'a mut QueryBuilder<'args, Postgres>,
    ) -> &'a mut QueryBuilder<'args, Postgres> {
        qb.push(if self.any { " AND " } else { " WHERE " });
        self.any = true;
        qb
    }
}

#[async_trait]
impl PersonStorage for PostgresStorage {
    async fn create(&self, person: &PersonRecord) -> StorageResult<()> {
        let started = Instant::now();

        sqlx::query(
            r#"
            INSERT INTO person (id, name, surname, patronymic, age, gender, nationality)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(person.id)
        .bind(&person.name)
        .bind(&person.surname)
        .bind(&person.patronymic)
        .bind(person.age)
        .bind(person.gender.as_str())
        .bind(&person.nationality)
        .execute(&self.pool)
        .await?;

        observe("create", started);
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StorageResult<Option<PersonRecord>> {
        let started = Instant::now();

        let row = sqlx::query_as::<_, PersonRow>(&format!("{SELECT_PERSON} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        observe("get_by_id", started);
        Ok(row.map(PersonRecord::from))
    }

    async fn get_with_filter(
        &self,
        filter: &FilterSpec,
        page: u32,
    ) -> StorageResult<Vec<PersonRecord>> {
        let started = Instant::now();

        let mut qb = QueryBuilder::<Postgres>::new(SELECT_PERSON);
        let mut conditions = Conditions { any: false };

        if let Some(id) = filter.id {
            conditions.next(&mut qb).push("id = ").push_bind(id);
        }
        if let Some(name) = &filter.name {
            conditions.next(&mut qb).push("name = ").push_bind(name.clone());
        }
        if let Some(surname) = &filter.surname {
            conditions
                .next(&mut qb)
                .push("surname = ")
                .push_bind(surname.clone());
        }
        if let Some(patronymic) = &filter.patronymic {
            conditions
                .next(&mut qb)
                .push("patronymic = ")
                .push_bind(patronymic.clone());
        }
        if let Some(age) = filter.age {
            conditions
                .next(&mut qb)
                .push("age BETWEEN ")
                .push_bind(age.min)
                .push(" AND ")
                .push_bind(age.max);
        }
        if let Some(gender) = filter.gender {
            conditions
                .next(&mut qb)
                .push("gender = ")
                .push_bind(gender.as_str());
        }
        if let Some(nationality) = &filter.nationality {
            conditions
                .next(&mut qb)
                .push("nationality = ")
                .push_bind(nationality.clone());
        }

        let limit = i64::from(self.page_size);
        qb.push(" ORDER BY name LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(i64::from(page) * limit);

        let rows = qb
            .build_query_as::<PersonRow>()
            .fetch_all(&self.pool)
            .await?;

        observe("get_with_filter", started);
        Ok(rows.into_iter().map(PersonRecord::from).collect())
    }

    async fn delete_by_id(&self, id: Uuid) -> StorageResult<()> {
        let started = Instant::now();

        let result = sqlx::query("DELETE FROM person WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        observe("delete_by_id", started);
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn change_by_id(&self, id: Uuid, changes: &ChangeSpec) -> StorageResult<()> {
        if changes.is_empty() {
            return Err(StorageError::NoChanges);
        }
        let started = Instant::now();

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE person SET ");
        let mut set = qb.separated(", ");
        if let Some(name) = &changes.name {
            set.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(surname) = &changes.surname {
            set.push("surname = ").push_bind_unseparated(surname.clone());
        }
        if let Some(patronymic) = &changes.patronymic {
            set.push("patronymic = ")
                .push_bind_unseparated(patronymic.clone());
        }
        if let Some(age) = changes.age {
            set.push("age = ").push_bind_unseparated(age);
        }
        if let Some(gender) = changes.gender {
            set.push("gender = ").push_bind_unseparated(gender.as_str());
        }
        if let Some(nationality) = &changes.nationality {
            set.push("nationality = ")
                .push_bind_unseparated(nationality.clone());
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await?;

        observe("change_by_id", started);
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgeRange;

    fn person(name: &str, age: i32, gender: Gender) -> PersonRecord {
        PersonRecord {
            id: Uuid::now_v7(),
            name: name.to_owned(),
            surname: "Ushakov".to_owned(),
            patronymic: None,
            age,
            gender,
            nationality: "RU".to_owned(),
        }
    }

    #[test]
    fn unknown_stored_gender_reads_as_unknown() {
        let row = PersonRow {
            id: Uuid::now_v7(),
            name: "A".to_owned(),
            surname: "B".to_owned(),
            patronymic: None,
            age: 1,
            gender: "".to_owned(),
            nationality: "US".to_owned(),
        };
        assert_eq!(PersonRecord::from(row).gender, Gender::Unknown);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires postgres"]
    async fn create_and_get(db: PgPool) {
        let storage = PostgresStorage::new(db, 5);
        let dmitriy = person("Dmitriy", 42, Gender::Male);

        storage.create(&dmitriy).await.unwrap();

        assert_eq!(storage.get_by_id(dmitriy.id).await.unwrap(), Some(dmitriy));
        assert_eq!(storage.get_by_id(Uuid::now_v7()).await.unwrap(), None);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires postgres"]
    async fn filter_orders_by_name_and_pages(db: PgPool) {
        let storage = PostgresStorage::new(db, 2);
        for (name, age) in [("Oleg", 30), ("Anna", 25), ("Ivan", 40), ("Boris", 35)] {
            storage
                .create(&person(name, age, Gender::Male))
                .await
                .unwrap();
        }

        let first = storage
            .get_with_filter(&FilterSpec::default(), 0)
            .await
            .unwrap();
        let names: Vec<_> = first.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Anna", "Boris"]);

        let second = storage
            .get_with_filter(&FilterSpec::default(), 1)
            .await
            .unwrap();
        let names: Vec<_> = second.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Ivan", "Oleg"]);

        let filter = FilterSpec {
            age: Some(AgeRange { min: 30, max: 40 }),
            gender: Some(Gender::Male),
            ..Default::default()
        };
        let matching = storage.get_with_filter(&filter, 0).await.unwrap();
        let names: Vec<_> = matching.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Boris", "Ivan"]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires postgres"]
    async fn change_and_delete(db: PgPool) {
        let storage = PostgresStorage::new(db, 5);
        let mut anna = person("Anna", 25, Gender::Female);
        anna.patronymic = Some("Petrovna".to_owned());
        storage.create(&anna).await.unwrap();

        assert!(matches!(
            storage.change_by_id(anna.id, &ChangeSpec::default()).await,
            Err(StorageError::NoChanges)
        ));

        let changes = ChangeSpec {
            age: Some(26),
            patronymic: Some(None),
            ..Default::default()
        };
        storage.change_by_id(anna.id, &changes).await.unwrap();
        let changed = storage.get_by_id(anna.id).await.unwrap().unwrap();
        assert_eq!(changed.age, 26);
        assert_eq!(changed.patronymic, None);

        storage.delete_by_id(anna.id).await.unwrap();
        assert!(matches!(
            storage.delete_by_id(anna.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.change_by_id(anna.id, &changes).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
