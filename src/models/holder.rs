use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Holder {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateHolderData {
    pub name: String,
    pub email: String,
    pub credential_hash: String,
}

impl Holder {
    /// Finds a holder by their internal ID
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let holder = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM holders WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(holder)
    }

    /// Finds holders for a batch of IDs
    pub async fn find_by_ids(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<Self>, sqlx::Error> {
        let holders = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM holders WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(pool)
        .await?;

        Ok(holders)
    }

    /// Finds a holder by (normalized) email
    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<Self>, sqlx::Error> {
        let holder = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM holders WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(pool)
        .await?;

        Ok(holder)
    }

    /// Finds the holder with this email or creates it.
    ///
    /// An existing holder is returned untouched; the supplied name and
    /// credential are only used for a new row.
    pub async fn find_or_create(pool: &PgPool, data: CreateHolderData) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO holders (name, email, credential_hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&data.name)
        .bind(&data.email)
        .bind(&data.credential_hash)
        .execute(pool)
        .await?;

        Self::find_by_email(pool, &data.email)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }
}
