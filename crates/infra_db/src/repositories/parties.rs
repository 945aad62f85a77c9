//! Company and administrator repository

use sqlx::PgPool;
use uuid::Uuid;

use domain_invoicing::{Admin, Company};

use crate::error::DatabaseError;

/// Administrator row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdminRow {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl From<AdminRow> for Admin {
    fn from(row: AdminRow) -> Self {
        Admin {
            user_id: core_kernel::UserId::from_uuid(row.user_id),
            email: row.email,
            phone: row.phone,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartyRepository {
    pool: PgPool,
}

impl PartyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_company(&self, id: Uuid) -> Result<Company, DatabaseError> {
        let body: serde_json::Value = sqlx::query_scalar("SELECT body FROM companies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::not_found("Company", id))?;
        Ok(serde_json::from_value(body)?)
    }

    /// Inserts or replaces a company document
    pub async fn upsert_company(&self, company: &Company) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO companies (id, body) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(company.id.as_uuid())
        .bind(serde_json::to_value(company)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_admins(&self) -> Result<Vec<AdminRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, AdminRow>(
            "SELECT user_id, email, phone FROM platform_admins WHERE active ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_admin(&self, admin: &Admin) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO platform_admins (user_id, email, phone) VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET email = EXCLUDED.email, phone = EXCLUDED.phone, active = true
            "#,
        )
        .bind(admin.user_id.as_uuid())
        .bind(&admin.email)
        .bind(&admin.phone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
