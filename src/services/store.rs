//! Gift card storage port and its adapters.
//!
//! Every write that changes an existing card goes through
//! [`GiftCardStore::update_if_version`], an atomic compare-and-swap on the
//! card's `version` column. Concurrent writers to the same card therefore
//! can't overwrite each other; cards with different ids share no lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::gift_card::{CardChange, GiftCard, NewGiftCard};

const CODE_UNIQUE_CONSTRAINT: &str = "gift_cards_code_key";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Gift card code already in use")]
    DuplicateCode,

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait GiftCardStore: Send + Sync {
    /// Persists a new card with `balance = amount` and `is_active = true`.
    async fn insert(&self, data: NewGiftCard) -> Result<GiftCard, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError>;

    async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>, StoreError>;

    /// All cards, newest first.
    async fn list(&self) -> Result<Vec<GiftCard>, StoreError>;

    /// Writes `change` only if the stored version equals `expected_version`,
    /// bumping the version. `None` means no row matched.
    async fn update_if_version(
        &self,
        id: Uuid,
        expected_version: i32,
        change: CardChange,
    ) -> Result<Option<GiftCard>, StoreError>;

    /// Removes the card and returns the row as it was when deleted, or
    /// `None` if it did not exist.
    async fn delete(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError>;
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgGiftCardStore {
    pool: PgPool,
}

impl PgGiftCardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_code_conflict(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.constraint() == Some(CODE_UNIQUE_CONSTRAINT)
        }
        _ => false,
    }
}

#[async_trait]
impl GiftCardStore for PgGiftCardStore {
    async fn insert(&self, data: NewGiftCard) -> Result<GiftCard, StoreError> {
        GiftCard::create(&self.pool, &data).await.map_err(|e| {
            if is_code_conflict(&e) {
                StoreError::DuplicateCode
            } else {
                StoreError::DatabaseError(e)
            }
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError> {
        Ok(GiftCard::find_by_id(&self.pool, id).await?)
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>, StoreError> {
        Ok(GiftCard::find_by_code(&self.pool, code).await?)
    }

    async fn list(&self) -> Result<Vec<GiftCard>, StoreError> {
        Ok(GiftCard::list(&self.pool).await?)
    }

    async fn update_if_version(
        &self,
        id: Uuid,
        expected_version: i32,
        change: CardChange,
    ) -> Result<Option<GiftCard>, StoreError> {
        Ok(GiftCard::update_if_version(&self.pool, id, expected_version, change).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError> {
        Ok(GiftCard::delete(&self.pool, id).await?)
    }
}

#[derive(Default)]
struct MemoryCards {
    by_id: HashMap<Uuid, GiftCard>,
    code_index: HashMap<String, Uuid>,
}

/// Process-local store for tests and database-less runs.
///
/// The map lock is only held for the check-and-write itself, never across
/// an `.await`.
#[derive(Clone, Default)]
pub struct InMemoryGiftCardStore {
    cards: Arc<Mutex<MemoryCards>>,
}

impl InMemoryGiftCardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryCards>, StoreError> {
        self.cards
            .lock()
            .map_err(|_| StoreError::Unavailable("gift card map poisoned".to_string()))
    }
}

#[async_trait]
impl GiftCardStore for InMemoryGiftCardStore {
    async fn insert(&self, data: NewGiftCard) -> Result<GiftCard, StoreError> {
        let mut cards = self.lock()?;

        if cards.code_index.contains_key(&data.code) {
            return Err(StoreError::DuplicateCode);
        }

        let now = Utc::now();
        let card = GiftCard {
            id: Uuid::new_v4(),
            code: data.code,
            amount: data.amount,
            balance: data.amount,
            is_active: true,
            holder_id: data.holder_id,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        cards.code_index.insert(card.code.clone(), card.id);
        cards.by_id.insert(card.id, card.clone());

        Ok(card)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError> {
        Ok(self.lock()?.by_id.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>, StoreError> {
        let cards = self.lock()?;
        Ok(cards
            .code_index
            .get(code)
            .and_then(|id| cards.by_id.get(id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<GiftCard>, StoreError> {
        let mut list: Vec<GiftCard> = self.lock()?.by_id.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn update_if_version(
        &self,
        id: Uuid,
        expected_version: i32,
        change: CardChange,
    ) -> Result<Option<GiftCard>, StoreError> {
        let mut cards = self.lock()?;

        let Some(card) = cards.by_id.get_mut(&id) else {
            return Ok(None);
        };
        if card.version != expected_version {
            return Ok(None);
        }

        card.balance = change.balance;
        card.is_active = change.is_active;
        card.version += 1;
        card.updated_at = Utc::now();

        Ok(Some(card.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError> {
        let mut cards = self.lock()?;

        let removed = cards.by_id.remove(&id);
        if let Some(card) = &removed {
            cards.code_index.remove(&card.code);
        }
        Ok(removed)
    }
}
