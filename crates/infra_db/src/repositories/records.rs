//! JSONB record repository
//!
//! Invoicing records live in one table as `(kind, id, version, body)`. Reads
//! decode `body` into the domain type; writes go through [`RecordRepository::apply`],
//! which checks every version inside a single transaction.

use serde::de::DeserializeOwned;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryScalar;
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use domain_invoicing::Record;

use crate::error::DatabaseError;

/// A record ready to be written
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub kind: &'static str,
    pub id: Uuid,
    pub version: i64,
    pub body: serde_json::Value,
}

impl StoredRecord {
    pub fn encode(record: &Record) -> Result<Self, DatabaseError> {
        let body = match record {
            Record::Job(r) => serde_json::to_value(r)?,
            Record::JobInvoice(r) => serde_json::to_value(r)?,
            Record::OwnerInvoice(r) => serde_json::to_value(r)?,
            Record::DriverInvoice(r) => serde_json::to_value(r)?,
            Record::Dispute(r) => serde_json::to_value(r)?,
            Record::LateFee(r) => serde_json::to_value(r)?,
            Record::ManualPayment(r) => serde_json::to_value(r)?,
        };
        Ok(Self {
            kind: record.entity_name(),
            id: record.id(),
            version: to_db_version(record.version())?,
            body,
        })
    }
}

fn to_db_version(version: u64) -> Result<i64, DatabaseError> {
    i64::try_from(version).map_err(|_| DatabaseError::SerializationError(format!("version {} overflows", version)))
}

/// Repository over the `invoicing_records` table
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: PgPool,
}

impl RecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Loads one record by kind and id
    pub async fn get<T: DeserializeOwned>(&self, kind: &'static str, id: Uuid) -> Result<T, DatabaseError> {
        let row = sqlx::query("SELECT body FROM invoicing_records WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::not_found(kind, id))?;
        let body: serde_json::Value = row.try_get("body")?;
        Ok(serde_json::from_value(body)?)
    }

    /// Loads every record of `kind` whose body field `field` equals `value`,
    /// ordered by `order_by` (a trusted SQL expression over `body`)
    pub async fn find_by_field<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        field: &'static str,
        value: &str,
        order_by: &'static str,
    ) -> Result<Vec<T>, DatabaseError> {
        let sql = format!(
            "SELECT body FROM invoicing_records WHERE kind = $1 AND body->>'{field}' = $2 ORDER BY {order_by}"
        );
        let bodies: Vec<serde_json::Value> = sqlx::query_scalar(&sql)
            .bind(kind)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        decode_all(bodies)
    }

    /// First match of [`find_by_field`](Self::find_by_field), if any
    pub async fn find_one_by_field<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        field: &'static str,
        value: &str,
        order_by: &'static str,
    ) -> Result<Option<T>, DatabaseError> {
        let sql = format!(
            "SELECT body FROM invoicing_records WHERE kind = $1 AND body->>'{field}' = $2 ORDER BY {order_by} LIMIT 1"
        );
        let body: Option<serde_json::Value> = sqlx::query_scalar(&sql)
            .bind(kind)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        body.map(serde_json::from_value).transpose().map_err(Into::into)
    }

    /// Runs a body query built by the caller and decodes every row
    pub async fn fetch_bodies<T: DeserializeOwned>(
        &self,
        query: QueryScalar<'_, Postgres, serde_json::Value, PgArguments>,
    ) -> Result<Vec<T>, DatabaseError> {
        let bodies = query.fetch_all(&self.pool).await?;
        decode_all(bodies)
    }

    pub async fn next_dispute_number(&self) -> Result<u64, DatabaseError> {
        let next: i64 = sqlx::query_scalar("SELECT nextval('dispute_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        u64::try_from(next).map_err(|_| DatabaseError::QueryFailed(format!("negative sequence value {}", next)))
    }

    /// Writes inserts and version-checked updates in one transaction
    ///
    /// Nothing is written unless every insert is new and every update's
    /// version still matches the stored one.
    pub async fn apply(&self, inserts: Vec<StoredRecord>, updates: Vec<StoredRecord>) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        for record in &inserts {
            let inserted = sqlx::query(
                r#"
                INSERT INTO invoicing_records (kind, id, version, body)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (kind, id) DO NOTHING
                "#,
            )
            .bind(record.kind)
            .bind(record.id)
            .bind(record.version)
            .bind(&record.body)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                return Err(DatabaseError::VersionConflict(format!(
                    "{} {} already exists",
                    record.kind, record.id
                )));
            }
        }

        for record in &updates {
            let next = record.version + 1;
            let mut body = record.body.clone();
            if let Some(fields) = body.as_object_mut() {
                fields.insert("version".to_string(), serde_json::Value::from(next));
            }

            let updated = sqlx::query(
                r#"
                UPDATE invoicing_records
                SET version = $4, body = $5, updated_at = now()
                WHERE kind = $1 AND id = $2 AND version = $3
                "#,
            )
            .bind(record.kind)
            .bind(record.id)
            .bind(record.version)
            .bind(next)
            .bind(&body)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                let current: Option<i64> =
                    sqlx::query_scalar("SELECT version FROM invoicing_records WHERE kind = $1 AND id = $2")
                        .bind(record.kind)
                        .bind(record.id)
                        .fetch_optional(&mut *tx)
                        .await?;
                return Err(match current {
                    None => DatabaseError::not_found(record.kind, record.id),
                    Some(current) => DatabaseError::VersionConflict(format!(
                        "{} {} is at version {}, expected {}",
                        record.kind, record.id, current, record.version
                    )),
                });
            }
        }

        tx.commit().await?;
        debug!(inserts = inserts.len(), updates = updates.len(), "Change set committed");
        Ok(())
    }
}

fn decode_all<T: DeserializeOwned>(bodies: Vec<serde_json::Value>) -> Result<Vec<T>, DatabaseError> {
    bodies
        .into_iter()
        .map(|b| serde_json::from_value(b).map_err(DatabaseError::from))
        .collect()
}
