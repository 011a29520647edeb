use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GiftCard {
    pub id: Uuid,
    pub code: String,
    pub amount: i64,  // minor units (cents), fixed at issuance
    pub balance: i64, // 0 <= balance <= amount
    pub is_active: bool,
    pub holder_id: Uuid,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGiftCard {
    pub code: String,
    pub amount: i64,
    pub holder_id: Uuid,
}

/// Mutable part of a gift card written by a version-checked update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardChange {
    pub balance: i64,
    pub is_active: bool,
}

impl GiftCard {
    /// Whether the balance lies within `0..=amount`
    pub fn accepts_balance(&self, balance: i64) -> bool {
        (0..=self.amount).contains(&balance)
    }

    /// Inserts a new card with a full balance
    pub async fn create(pool: &PgPool, data: &NewGiftCard) -> Result<Self, sqlx::Error> {
        let card = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO gift_cards (code, amount, balance, is_active, holder_id)
            VALUES ($1, $2, $2, TRUE, $3)
            RETURNING *
            "#,
        )
        .bind(&data.code)
        .bind(data.amount)
        .bind(data.holder_id)
        .fetch_one(pool)
        .await?;

        Ok(card)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let card = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM gift_cards WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(card)
    }

    pub async fn find_by_code(pool: &PgPool, code: &str) -> Result<Option<Self>, sqlx::Error> {
        let card = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM gift_cards WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(pool)
        .await?;

        Ok(card)
    }

    /// Lists all cards, newest first
    pub async fn list(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        let cards = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM gift_cards
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(cards)
    }

    /// Applies `change` only if the row still carries `expected_version`.
    ///
    /// Returns `None` when no row matched, either because the card is gone or
    /// because another writer bumped the version first.
    pub async fn update_if_version(
        pool: &PgPool,
        id: Uuid,
        expected_version: i32,
        change: CardChange,
    ) -> Result<Option<Self>, sqlx::Error> {
        let card = sqlx::query_as::<_, Self>(
            r#"
            UPDATE gift_cards
            SET
                balance = $3,
                is_active = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(change.balance)
        .bind(change.is_active)
        .fetch_optional(pool)
        .await?;

        Ok(card)
    }

    /// Deletes a card, returning the removed row
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let card = sqlx::query_as::<_, Self>(
            r#"
            DELETE FROM gift_cards WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(card)
    }
}
