//! Holder directory collaborator.
//!
//! Holders are owned by the site's user directory; the ledger only resolves
//! them (creating one with a temporary credential when the email is new) and
//! reads their name and email for display and notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::holder::{CreateHolderData, Holder};

const TEMP_CREDENTIAL_BYTES: usize = 24;

#[derive(thiserror::Error, Debug)]
pub enum HolderError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Secure random source unavailable")]
    RandomUnavailable,

    #[error("Holder directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait HolderDirectory: Send + Sync {
    /// Returns the holder registered under `email`, creating it if absent.
    /// Idempotent: repeated calls with the same email yield the same holder.
    async fn resolve_or_create(&self, name: &str, email: &str) -> Result<Holder, HolderError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Holder>, HolderError>;

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Holder>, HolderError>;
}

/// Trims and lowercases an email for lookup
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Generates a random temporary credential and returns its SHA-256 hex digest.
/// The plaintext is discarded; the holder sets a real one through the site.
fn temporary_credential_hash() -> Result<String, HolderError> {
    let mut secret = [0u8; TEMP_CREDENTIAL_BYTES];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| HolderError::RandomUnavailable)?;

    let hash = digest::digest(&digest::SHA256, &secret);
    Ok(hex::encode(hash.as_ref()))
}

/// PostgreSQL-backed directory
#[derive(Clone)]
pub struct PgHolderDirectory {
    pool: PgPool,
}

impl PgHolderDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HolderDirectory for PgHolderDirectory {
    async fn resolve_or_create(&self, name: &str, email: &str) -> Result<Holder, HolderError> {
        let email = normalize_email(email);

        if let Some(existing) = Holder::find_by_email(&self.pool, &email).await? {
            return Ok(existing);
        }

        let holder = Holder::find_or_create(
            &self.pool,
            CreateHolderData {
                name: name.trim().to_string(),
                email,
                credential_hash: temporary_credential_hash()?,
            },
        )
        .await?;

        tracing::info!(holder_id = %holder.id, "Holder resolved");

        Ok(holder)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Holder>, HolderError> {
        Ok(Holder::find_by_id(&self.pool, id).await?)
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Holder>, HolderError> {
        let holders = Holder::find_by_ids(&self.pool, ids).await?;
        Ok(holders.into_iter().map(|h| (h.id, h)).collect())
    }
}

/// Process-local directory for tests and database-less runs
#[derive(Clone, Default)]
pub struct InMemoryHolderDirectory {
    holders: Arc<Mutex<HashMap<Uuid, Holder>>>,
}

impl InMemoryHolderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Holder>>, HolderError> {
        self.holders
            .lock()
            .map_err(|_| HolderError::Unavailable("holder map poisoned".to_string()))
    }
}

#[async_trait]
impl HolderDirectory for InMemoryHolderDirectory {
    async fn resolve_or_create(&self, name: &str, email: &str) -> Result<Holder, HolderError> {
        let email = normalize_email(email);
        let credential_hash = temporary_credential_hash()?;
        let mut holders = self.lock()?;

        if let Some(existing) = holders.values().find(|h| h.email == email) {
            return Ok(existing.clone());
        }

        let holder = Holder {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            email,
            credential_hash,
            created_at: Utc::now(),
        };
        holders.insert(holder.id, holder.clone());

        Ok(holder)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Holder>, HolderError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Holder>, HolderError> {
        let holders = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| holders.get(id).map(|h| (*id, h.clone())))
            .collect())
    }
}
