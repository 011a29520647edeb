use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::gift_card::{CardChange, GiftCard, NewGiftCard};
use crate::models::holder::Holder;
use crate::services::certificate::{self, CertificateData, CertificateError, CompanyInfo};
use crate::services::code_generator::{is_valid_code, CodeGenerationError, CodeSource};
use crate::services::holders::{HolderDirectory, HolderError};
use crate::services::notifier::{
    FailedDelivery, GiftCardNotification, NotificationDispatcher, NotificationKey,
    NotificationKind,
};
use crate::services::qr_generator::{self, QrGenerationError};
use crate::services::store::{GiftCardStore, StoreError};

/// Issue attempts before giving up on finding an unused code
pub const MAX_CODE_ATTEMPTS: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Balance must be between 0 and {amount}")]
    InvalidBalance { amount: i64 },

    #[error("Invalid holder: {0}")]
    InvalidHolder(String),

    #[error("Gift card not found")]
    NotFound,

    #[error("Gift card was modified by another request. Reload and try again.")]
    Conflict,

    #[error("No unused gift card code found after {0} attempts")]
    CodeSpaceExhausted(u32),

    #[error("Code generation failed: {0}")]
    CodeGeneration(#[from] CodeGenerationError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Holder directory error: {0}")]
    Holder(#[from] HolderError),

    #[error("QR generation failed: {0}")]
    QrGeneration(#[from] QrGenerationError),

    #[error("Certificate rendering failed: {0}")]
    Certificate(#[from] CertificateError),
}

/// Request to issue a new gift card
#[derive(Debug, Clone, Deserialize)]
pub struct IssueRequest {
    pub holder_name: String,
    pub holder_email: String,
    pub amount: i64,
}

/// Combined balance / active-flag update. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGiftCard {
    pub balance: Option<i64>,
    pub is_active: Option<bool>,
    /// Version the caller last saw; a mismatch is rejected as a conflict
    pub expected_version: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderSummary {
    pub name: String,
    pub email: String,
}

/// Gift card with its holder's name and email inlined
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GiftCardView {
    pub id: Uuid,
    pub code: String,
    pub amount: i64,
    pub balance: i64,
    pub is_active: bool,
    pub version: i32,
    pub holder: Option<HolderSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GiftCardView {
    fn new(card: GiftCard, holder: Option<&Holder>) -> Self {
        Self {
            id: card.id,
            code: card.code,
            amount: card.amount,
            balance: card.balance,
            is_active: card.is_active,
            version: card.version,
            holder: holder.map(|h| HolderSummary {
                name: h.name.clone(),
                email: h.email.clone(),
            }),
            created_at: card.created_at,
            updated_at: card.updated_at,
        }
    }
}

/// A rendered printable certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    pub filename: String,
    pub bytes: Vec<u8>,
}

fn notification(
    card: &GiftCard,
    holder: &Holder,
    kind: NotificationKind,
    previous_balance: Option<i64>,
) -> GiftCardNotification {
    GiftCardNotification {
        key: NotificationKey {
            gift_card_id: card.id,
            kind,
            version: card.version,
        },
        code: card.code.clone(),
        amount: card.amount,
        balance: card.balance,
        previous_balance,
        holder_name: holder.name.clone(),
        holder_email: holder.email.clone(),
    }
}

/// Gift card ledger: the only writer of gift card state
#[derive(Clone)]
pub struct GiftCardLedger {
    store: Arc<dyn GiftCardStore>,
    holders: Arc<dyn HolderDirectory>,
    codes: Arc<dyn CodeSource>,
    notifier: NotificationDispatcher,
    company: Arc<CompanyInfo>,
}

impl GiftCardLedger {
    pub fn new(
        store: Arc<dyn GiftCardStore>,
        holders: Arc<dyn HolderDirectory>,
        codes: Arc<dyn CodeSource>,
        notifier: NotificationDispatcher,
        company: CompanyInfo,
    ) -> Self {
        Self {
            store,
            holders,
            codes,
            notifier,
            company: Arc::new(company),
        }
    }

    /// Issues a new card with a full balance.
    ///
    /// 1. Validates amount and holder details
    /// 2. Resolves (or creates) the holder
    /// 3. Persists the card under a fresh code, regenerating on collision
    /// 4. Queues the `Issued` notification
    #[tracing::instrument(skip(self, request), fields(amount = request.amount))]
    pub async fn issue(&self, request: IssueRequest) -> Result<GiftCardView, LedgerError> {
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if request.holder_name.trim().is_empty() {
            return Err(LedgerError::InvalidHolder("Holder name is required".to_string()));
        }
        let email = request.holder_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(LedgerError::InvalidHolder(
                "A valid holder email is required".to_string(),
            ));
        }

        let holder = self
            .holders
            .resolve_or_create(&request.holder_name, email)
            .await?;

        let card = self.insert_with_unique_code(request.amount, holder.id).await?;

        tracing::info!(
            card_id = %card.id,
            holder_id = %holder.id,
            "Gift card issued"
        );

        self.notifier
            .enqueue(notification(&card, &holder, NotificationKind::Issued, None));

        Ok(GiftCardView::new(card, Some(&holder)))
    }

    async fn insert_with_unique_code(
        &self,
        amount: i64,
        holder_id: Uuid,
    ) -> Result<GiftCard, LedgerError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = self.codes.generate()?;

            match self
                .store
                .insert(NewGiftCard {
                    code,
                    amount,
                    holder_id,
                })
                .await
            {
                Ok(card) => return Ok(card),
                Err(StoreError::DuplicateCode) => {
                    tracing::warn!(attempt, "Gift card code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            attempts = MAX_CODE_ATTEMPTS,
            "Could not allocate a unique gift card code"
        );
        Err(LedgerError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Sets the balance to `new_balance`
    pub async fn adjust_balance(&self, id: Uuid, new_balance: i64) -> Result<GiftCardView, LedgerError> {
        self.update(
            id,
            UpdateGiftCard {
                balance: Some(new_balance),
                ..UpdateGiftCard::default()
            },
        )
        .await
    }

    /// Activates or deactivates a card; a no-op if the flag already matches
    pub async fn set_active(&self, id: Uuid, is_active: bool) -> Result<GiftCardView, LedgerError> {
        self.update(
            id,
            UpdateGiftCard {
                is_active: Some(is_active),
                ..UpdateGiftCard::default()
            },
        )
        .await
    }

    /// Applies a combined balance / active update with a version check.
    ///
    /// The write is conditional on the version read here, so a concurrent
    /// writer that commits first turns this call into `Conflict` instead of
    /// being silently overwritten.
    #[tracing::instrument(skip(self, update), fields(card_id = %id))]
    pub async fn update(&self, id: Uuid, update: UpdateGiftCard) -> Result<GiftCardView, LedgerError> {
        let current = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(LedgerError::NotFound)?;

        if let Some(expected) = update.expected_version {
            if expected != current.version {
                tracing::info!(
                    expected,
                    actual = current.version,
                    "Rejected update with stale version"
                );
                return Err(LedgerError::Conflict);
            }
        }

        let balance = update.balance.unwrap_or(current.balance);
        if !current.accepts_balance(balance) {
            return Err(LedgerError::InvalidBalance {
                amount: current.amount,
            });
        }
        let is_active = update.is_active.unwrap_or(current.is_active);

        let updated = if balance == current.balance && is_active == current.is_active {
            current.clone()
        } else {
            let change = CardChange { balance, is_active };
            match self
                .store
                .update_if_version(id, current.version, change)
                .await?
            {
                Some(card) => card,
                None => {
                    // Lost the race: either revoked or another write committed first
                    return Err(match self.store.find_by_id(id).await? {
                        Some(_) => LedgerError::Conflict,
                        None => LedgerError::NotFound,
                    });
                }
            }
        };

        if updated.version != current.version {
            tracing::info!(
                balance = updated.balance,
                previous_balance = current.balance,
                is_active = updated.is_active,
                version = updated.version,
                "Gift card updated"
            );
        }

        let holder = self.holder_after_commit(&updated).await;

        if updated.balance != current.balance {
            match &holder {
                Some(holder) => self.notifier.enqueue(notification(
                    &updated,
                    holder,
                    NotificationKind::BalanceChanged,
                    Some(current.balance),
                )),
                None => tracing::warn!("Holder unavailable, balance notification skipped"),
            }
        }

        Ok(GiftCardView::new(updated, holder.as_ref()))
    }

    /// Permanently deletes a card. Every later operation on `id` is `NotFound`.
    #[tracing::instrument(skip(self), fields(card_id = %id))]
    pub async fn revoke(&self, id: Uuid) -> Result<(), LedgerError> {
        // The notification describes the row as it was when deleted
        let card = self.store.delete(id).await?.ok_or(LedgerError::NotFound)?;

        tracing::info!(code = %card.code, version = card.version, "Gift card revoked");

        match self.holder_after_commit(&card).await {
            Some(holder) => self.notifier.enqueue(notification(
                &card,
                &holder,
                NotificationKind::Revoked,
                None,
            )),
            None => tracing::warn!("Holder unavailable, revocation notification skipped"),
        }

        Ok(())
    }

    /// Looks up the holder once a write has committed. Failures are logged
    /// rather than returned so the committed result still reaches the caller.
    async fn holder_after_commit(&self, card: &GiftCard) -> Option<Holder> {
        match self.holders.find_by_id(card.holder_id).await {
            Ok(holder) => holder,
            Err(e) => {
                tracing::warn!(
                    card_id = %card.id,
                    holder_id = %card.holder_id,
                    error = %e,
                    "Holder lookup failed after commit"
                );
                None
            }
        }
    }

    async fn find(&self, id: Uuid) -> Result<GiftCard, LedgerError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(LedgerError::NotFound)
    }

    pub async fn get(&self, id: Uuid) -> Result<GiftCardView, LedgerError> {
        let card = self.find(id).await?;
        let holder = self.holders.find_by_id(card.holder_id).await?;
        Ok(GiftCardView::new(card, holder.as_ref()))
    }

    /// Looks a card up by its bearer code (case-insensitive)
    pub async fn get_by_code(&self, code: &str) -> Result<GiftCardView, LedgerError> {
        let code = code.trim().to_uppercase();
        if !is_valid_code(&code) {
            return Err(LedgerError::NotFound);
        }

        let card = self
            .store
            .find_by_code(&code)
            .await?
            .ok_or(LedgerError::NotFound)?;
        let holder = self.holders.find_by_id(card.holder_id).await?;
        Ok(GiftCardView::new(card, holder.as_ref()))
    }

    /// All cards, newest first
    pub async fn list(&self) -> Result<Vec<GiftCardView>, LedgerError> {
        let cards = self.store.list().await?;

        let mut holder_ids: Vec<Uuid> = cards.iter().map(|c| c.holder_id).collect();
        holder_ids.sort();
        holder_ids.dedup();
        let holders = self.holders.find_by_ids(&holder_ids).await?;

        Ok(cards
            .into_iter()
            .map(|card| {
                let holder = holders.get(&card.holder_id);
                GiftCardView::new(card, holder)
            })
            .collect())
    }

    /// Renders the printable certificate for a card
    #[tracing::instrument(skip(self), fields(card_id = %id))]
    pub async fn export_certificate(&self, id: Uuid) -> Result<Certificate, LedgerError> {
        let card = self.find(id).await?;
        let holder = self.holders.find_by_id(card.holder_id).await?;
        let qr = qr_generator::encode_png(&card.code)?;

        let data = CertificateData {
            code: card.code.clone(),
            amount: card.amount,
            holder_name: holder.as_ref().map(|h| h.name.clone()).unwrap_or_default(),
            holder_email: holder.as_ref().map(|h| h.email.clone()).unwrap_or_default(),
            issued_at: card.created_at,
        };
        let bytes = certificate::render_certificate(&data, &qr.png, &self.company)?;

        tracing::debug!(size = bytes.len(), "Certificate rendered");

        Ok(Certificate {
            filename: format!("giftcard-{}.pdf", card.code),
            bytes,
        })
    }

    pub async fn qr_png(&self, id: Uuid) -> Result<Vec<u8>, LedgerError> {
        let card = self.find(id).await?;
        Ok(qr_generator::encode_png(&card.code)?.png)
    }

    pub async fn qr_svg(&self, id: Uuid) -> Result<String, LedgerError> {
        let card = self.find(id).await?;
        Ok(qr_generator::encode_svg(&card.code)?)
    }

    /// Notifications that were dropped after exhausting their retries
    pub fn failed_notifications(&self) -> Vec<FailedDelivery> {
        self.notifier.delivery_log().failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::services::code_generator::SecureCodeGenerator;
    use crate::services::holders::InMemoryHolderDirectory;
    use async_trait::async_trait;
    use tokio::sync::{Barrier, Notify};

    use crate::services::notifier::{DispatcherLimits, DispatcherWorker, EmailComposer, RetryPolicy};
    use crate::services::store::InMemoryGiftCardStore;
    use crate::test_support::RecordingMailer;

    /// Hands out a fixed sequence of codes, then repeats the last one
    struct ScriptedCodes {
        codes: Mutex<VecDeque<String>>,
        last: String,
    }

    impl ScriptedCodes {
        fn new(codes: &[&str]) -> Self {
            Self {
                codes: Mutex::new(codes.iter().map(|c| c.to_string()).collect()),
                last: codes.last().unwrap().to_string(),
            }
        }
    }

    impl CodeSource for ScriptedCodes {
        fn generate(&self) -> Result<String, CodeGenerationError> {
            Ok(self
                .codes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.last.clone()))
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum WriteOrder {
        Any,
        DeleteFirst,
        UpdateFirst,
    }

    /// Holds each write until a second writer arrives, so both writers act on
    /// what they read before either commits. Built for exactly two writes.
    struct RacingStore {
        inner: InMemoryGiftCardStore,
        writers: Barrier,
        order: WriteOrder,
        first_committed: Notify,
    }

    impl RacingStore {
        fn new(order: WriteOrder) -> Self {
            Self {
                inner: InMemoryGiftCardStore::new(),
                writers: Barrier::new(2),
                order,
                first_committed: Notify::new(),
            }
        }

        async fn write_turn(&self, goes_first: bool) {
            self.writers.wait().await;
            if self.order != WriteOrder::Any && !goes_first {
                self.first_committed.notified().await;
            }
        }

        fn committed(&self, goes_first: bool) {
            if self.order != WriteOrder::Any && goes_first {
                self.first_committed.notify_one();
            }
        }
    }

    #[async_trait]
    impl GiftCardStore for RacingStore {
        async fn insert(&self, data: NewGiftCard) -> Result<GiftCard, StoreError> {
            self.inner.insert(data).await
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>, StoreError> {
            self.inner.find_by_code(code).await
        }

        async fn list(&self) -> Result<Vec<GiftCard>, StoreError> {
            self.inner.list().await
        }

        async fn update_if_version(
            &self,
            id: Uuid,
            expected_version: i32,
            change: CardChange,
        ) -> Result<Option<GiftCard>, StoreError> {
            let goes_first = self.order == WriteOrder::UpdateFirst;
            self.write_turn(goes_first).await;
            let result = self.inner.update_if_version(id, expected_version, change).await;
            self.committed(goes_first);
            result
        }

        async fn delete(&self, id: Uuid) -> Result<Option<GiftCard>, StoreError> {
            let goes_first = self.order == WriteOrder::DeleteFirst;
            self.write_turn(goes_first).await;
            let result = self.inner.delete(id).await;
            self.committed(goes_first);
            result
        }
    }

    struct Harness {
        ledger: GiftCardLedger,
        mailer: RecordingMailer,
        worker: DispatcherWorker,
    }

    fn company() -> CompanyInfo {
        CompanyInfo {
            name: "The Copper Still".to_string(),
            currency_symbol: "$".to_string(),
            ..CompanyInfo::default()
        }
    }

    fn build(
        store: Arc<dyn GiftCardStore>,
        codes: Arc<dyn CodeSource>,
        mailer: RecordingMailer,
    ) -> Harness {
        let (dispatcher, worker) = NotificationDispatcher::start(
            Arc::new(mailer.clone()),
            EmailComposer::new(company()),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            DispatcherLimits {
                queue_capacity: 64,
                ..DispatcherLimits::default()
            },
        );
        let ledger = GiftCardLedger::new(
            store,
            Arc::new(InMemoryHolderDirectory::new()),
            codes,
            dispatcher,
            company(),
        );

        Harness {
            ledger,
            mailer,
            worker,
        }
    }

    fn harness_with(codes: Arc<dyn CodeSource>, mailer: RecordingMailer) -> Harness {
        build(Arc::new(InMemoryGiftCardStore::new()), codes, mailer)
    }

    fn racing_harness(order: WriteOrder) -> Harness {
        build(
            Arc::new(RacingStore::new(order)),
            Arc::new(SecureCodeGenerator::new()),
            RecordingMailer::new(),
        )
    }

    fn spawn_update(
        ledger: &GiftCardLedger,
        id: Uuid,
        update: UpdateGiftCard,
    ) -> tokio::task::JoinHandle<Result<GiftCardView, LedgerError>> {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.update(id, update).await })
    }

    fn harness() -> Harness {
        harness_with(Arc::new(SecureCodeGenerator::new()), RecordingMailer::new())
    }

    fn issue_request(amount: i64) -> IssueRequest {
        IssueRequest {
            holder_name: "Ada Lovelace".to_string(),
            holder_email: "ada@example.com".to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_issue_sets_full_balance() {
        let h = harness();

        // Scenario A
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        assert_eq!(card.amount, 50);
        assert_eq!(card.balance, 50);
        assert!(card.is_active);
        assert!(is_valid_code(&card.code));
        assert_eq!(
            card.holder,
            Some(HolderSummary {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.com".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_issue_rejects_non_positive_amount() {
        let h = harness();

        for amount in [0, -1, -5000] {
            let result = h.ledger.issue(issue_request(amount)).await;
            assert!(matches!(result, Err(LedgerError::InvalidAmount)));
        }
        assert!(h.ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_issue_rejects_bad_holder() {
        let h = harness();

        let mut request = issue_request(50);
        request.holder_email = "not-an-email".to_string();
        assert!(matches!(
            h.ledger.issue(request).await,
            Err(LedgerError::InvalidHolder(_))
        ));

        let mut request = issue_request(50);
        request.holder_name = "  ".to_string();
        assert!(matches!(
            h.ledger.issue(request).await,
            Err(LedgerError::InvalidHolder(_))
        ));
    }

    #[tokio::test]
    async fn test_balance_scenarios() {
        let h = harness();
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        // Scenario B
        let updated = h.ledger.adjust_balance(card.id, 20).await.unwrap();
        assert_eq!(updated.balance, 20);

        // Scenario C
        let negative = h.ledger.adjust_balance(card.id, -5).await;
        assert!(matches!(negative, Err(LedgerError::InvalidBalance { amount: 50 })));
        assert_eq!(h.ledger.get(card.id).await.unwrap().balance, 20);

        // Scenario D
        let too_high = h.ledger.adjust_balance(card.id, 80).await;
        assert!(matches!(too_high, Err(LedgerError::InvalidBalance { amount: 50 })));
        assert_eq!(h.ledger.get(card.id).await.unwrap().balance, 20);

        // Bounds are inclusive
        assert_eq!(h.ledger.adjust_balance(card.id, 0).await.unwrap().balance, 0);
        assert_eq!(h.ledger.adjust_balance(card.id, 50).await.unwrap().balance, 50);
    }

    #[tokio::test]
    async fn test_revoke_is_terminal() {
        let h = harness();
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        // Scenario E
        h.ledger.revoke(card.id).await.unwrap();

        assert!(matches!(
            h.ledger.adjust_balance(card.id, 10).await,
            Err(LedgerError::NotFound)
        ));
        assert!(matches!(
            h.ledger.set_active(card.id, false).await,
            Err(LedgerError::NotFound)
        ));
        assert!(matches!(h.ledger.revoke(card.id).await, Err(LedgerError::NotFound)));
        assert!(matches!(h.ledger.get(card.id).await, Err(LedgerError::NotFound)));
        assert!(matches!(
            h.ledger.export_certificate(card.id).await,
            Err(LedgerError::NotFound)
        ));
        assert!(matches!(
            h.ledger.get_by_code(&card.code).await,
            Err(LedgerError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_updates_on_same_version_conflict() {
        let h = racing_harness(WriteOrder::Any);
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        // Scenario F: both writers saw the same version
        let first = spawn_update(
            &h.ledger,
            card.id,
            UpdateGiftCard {
                balance: Some(30),
                expected_version: Some(card.version),
                ..UpdateGiftCard::default()
            },
        );
        let second = spawn_update(
            &h.ledger,
            card.id,
            UpdateGiftCard {
                balance: Some(10),
                expected_version: Some(card.version),
                ..UpdateGiftCard::default()
            },
        );

        let results = [first.await.unwrap(), second.await.unwrap()];
        let winners: Vec<&GiftCardView> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::Conflict)))
            .count();

        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 1);

        let stored = h.ledger.get(card.id).await.unwrap();
        assert_eq!(stored.balance, winners[0].balance);
        assert_eq!(stored.version, card.version + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unversioned_writers_on_same_read_conflict() {
        let h = racing_harness(WriteOrder::Any);
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        let first = spawn_update(
            &h.ledger,
            card.id,
            UpdateGiftCard {
                balance: Some(40),
                ..UpdateGiftCard::default()
            },
        );
        let second = spawn_update(
            &h.ledger,
            card.id,
            UpdateGiftCard {
                balance: Some(5),
                ..UpdateGiftCard::default()
            },
        );

        let results = [first.await.unwrap(), second.await.unwrap()];
        let winners: Vec<&GiftCardView> = results.iter().filter_map(|r| r.as_ref().ok()).collect();

        // The loser read the same version and must not overwrite the winner
        assert_eq!(winners.len(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(LedgerError::Conflict))));

        let stored = h.ledger.get(card.id).await.unwrap();
        assert_eq!(stored.balance, winners[0].balance);
        assert_eq!(stored.version, card.version + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_adjust_losing_to_revoke_is_not_found() {
        let h = racing_harness(WriteOrder::DeleteFirst);
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        let adjust = spawn_update(
            &h.ledger,
            card.id,
            UpdateGiftCard {
                balance: Some(20),
                ..UpdateGiftCard::default()
            },
        );
        let revoke = {
            let ledger = h.ledger.clone();
            tokio::spawn(async move { ledger.revoke(card.id).await })
        };

        revoke.await.unwrap().unwrap();
        assert!(matches!(adjust.await.unwrap(), Err(LedgerError::NotFound)));
        assert!(matches!(h.ledger.get(card.id).await, Err(LedgerError::NotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_after_concurrent_adjust_reports_final_version() {
        let h = racing_harness(WriteOrder::UpdateFirst);
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        let adjust = spawn_update(
            &h.ledger,
            card.id,
            UpdateGiftCard {
                balance: Some(20),
                ..UpdateGiftCard::default()
            },
        );
        let revoke = {
            let ledger = h.ledger.clone();
            tokio::spawn(async move { ledger.revoke(card.id).await })
        };

        let adjusted = adjust.await.unwrap().unwrap();
        revoke.await.unwrap().unwrap();
        assert_eq!(adjusted.version, card.version + 1);

        let ledger = h.ledger.clone();
        h.worker.shutdown().await;

        // The revocation carries the version the card had when deleted
        let revoked = NotificationKey {
            gift_card_id: card.id,
            kind: NotificationKind::Revoked,
            version: adjusted.version,
        };
        assert!(ledger.notifier.delivery_log().is_delivered(&revoked));
        assert!(ledger.failed_notifications().is_empty());
    }

    #[tokio::test]
    async fn test_many_concurrent_adjustments_never_break_invariant() {
        let h = harness();
        let card = h.ledger.issue(issue_request(100)).await.unwrap();

        let mut handles = Vec::new();
        for target in [-10, 0, 25, 50, 75, 100, 150, 33, 66, 99] {
            let ledger = h.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.adjust_balance(card.id, target).await
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(view) => {
                    assert!((0..=100).contains(&view.balance));
                    versions.push(view.version);
                }
                Err(LedgerError::InvalidBalance { .. }) | Err(LedgerError::Conflict) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let stored = h.ledger.get(card.id).await.unwrap();
        assert!((0..=100).contains(&stored.balance));
        assert_eq!(
            stored.version,
            versions.into_iter().max().unwrap_or(card.version)
        );
    }

    #[tokio::test]
    async fn test_set_active_toggles_and_is_idempotent() {
        let h = harness();
        let card = h.ledger.issue(issue_request(50)).await.unwrap();

        let inactive = h.ledger.set_active(card.id, false).await.unwrap();
        assert!(!inactive.is_active);
        assert_eq!(inactive.version, card.version + 1);

        let again = h.ledger.set_active(card.id, false).await.unwrap();
        assert_eq!(again.version, inactive.version);

        // Balance stays adjustable while inactive
        let adjusted = h.ledger.adjust_balance(card.id, 5).await.unwrap();
        assert_eq!(adjusted.balance, 5);
        assert!(!adjusted.is_active);

        let active = h.ledger.set_active(card.id, true).await.unwrap();
        assert!(active.is_active);
    }

    #[tokio::test]
    async fn test_stale_expected_version_is_rejected() {
        let h = harness();
        let card = h.ledger.issue(issue_request(50)).await.unwrap();
        h.ledger.adjust_balance(card.id, 40).await.unwrap();

        let result = h
            .ledger
            .update(
                card.id,
                UpdateGiftCard {
                    balance: Some(10),
                    is_active: None,
                    expected_version: Some(card.version),
                },
            )
            .await;

        assert!(matches!(result, Err(LedgerError::Conflict)));
        assert_eq!(h.ledger.get(card.id).await.unwrap().balance, 40);
    }

    #[tokio::test]
    async fn test_code_collision_is_retried() {
        let h = harness_with(
            Arc::new(ScriptedCodes::new(&["AAAAAAAAAAAA", "AAAAAAAAAAAA", "BBBBBBBBBBBB"])),
            RecordingMailer::new(),
        );

        let first = h.ledger.issue(issue_request(10)).await.unwrap();
        let second = h.ledger.issue(issue_request(10)).await.unwrap();

        assert_eq!(first.code, "AAAAAAAAAAAA");
        assert_eq!(second.code, "BBBBBBBBBBBB");
    }

    #[tokio::test]
    async fn test_exhausted_code_space_is_reported() {
        let h = harness_with(
            Arc::new(ScriptedCodes::new(&["AAAAAAAAAAAA"])),
            RecordingMailer::new(),
        );
        h.ledger.issue(issue_request(10)).await.unwrap();

        let result = h.ledger.issue(issue_request(10)).await;

        assert!(matches!(
            result,
            Err(LedgerError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
        ));
        assert_eq!(h.ledger.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_issues_have_unique_codes() {
        let h = harness();

        let mut handles = Vec::new();
        for i in 0..50 {
            let ledger = h.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .issue(IssueRequest {
                        holder_name: format!("Guest {}", i),
                        holder_email: format!("guest{}@example.com", i),
                        amount: 1000,
                    })
                    .await
            }));
        }

        let mut codes = HashSet::new();
        for handle in handles {
            codes.insert(handle.await.unwrap().unwrap().code);
        }

        assert_eq!(codes.len(), 50);
        assert_eq!(h.ledger.list().await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_list_inlines_holders_newest_first() {
        let h = harness();
        let first = h.ledger.issue(issue_request(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h
            .ledger
            .issue(IssueRequest {
                holder_name: "Grace Hopper".to_string(),
                holder_email: "grace@example.com".to_string(),
                amount: 20,
            })
            .await
            .unwrap();

        let list = h.ledger.list().await.unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
        assert_eq!(list[0].holder.as_ref().unwrap().name, "Grace Hopper");
        assert_eq!(list[1].holder.as_ref().unwrap().email, "ada@example.com");
    }

    #[tokio::test]
    async fn test_get_by_code_is_case_insensitive() {
        let h = harness();
        let card = h.ledger.issue(issue_request(10)).await.unwrap();

        let found = h.ledger.get_by_code(&card.code.to_lowercase()).await.unwrap();
        assert_eq!(found.id, card.id);

        assert!(matches!(
            h.ledger.get_by_code("nope").await,
            Err(LedgerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_export_certificate() {
        let h = harness();
        let card = h.ledger.issue(issue_request(5000)).await.unwrap();

        let certificate = h.ledger.export_certificate(card.id).await.unwrap();
        let again = h.ledger.export_certificate(card.id).await.unwrap();

        assert_eq!(certificate.filename, format!("giftcard-{}.pdf", card.code));
        assert!(certificate.bytes.starts_with(b"%PDF-"));
        assert_eq!(certificate.bytes, again.bytes);
    }

    #[tokio::test]
    async fn test_lifecycle_notifications() {
        let h = harness();
        let card = h.ledger.issue(issue_request(50)).await.unwrap();
        h.ledger.adjust_balance(card.id, 20).await.unwrap();
        // No balance change, no notification
        h.ledger.set_active(card.id, false).await.unwrap();
        h.ledger.revoke(card.id).await.unwrap();

        let mailer = h.mailer.clone();
        h.worker.shutdown().await;

        let mut subjects: Vec<String> = mailer.sent().into_iter().map(|m| m.subject).collect();
        subjects.sort();
        assert_eq!(
            subjects,
            vec![
                "Your The Copper Still gift card".to_string(),
                "Your The Copper Still gift card balance was updated".to_string(),
                "Your The Copper Still gift card has been cancelled".to_string(),
            ]
        );
        assert!(mailer.sent().iter().all(|m| m.to == "ada@example.com"));
    }

    #[tokio::test]
    async fn test_mail_outage_does_not_fail_ledger() {
        let h = harness_with(
            Arc::new(SecureCodeGenerator::new()),
            RecordingMailer::always_failing(),
        );

        let card = h.ledger.issue(issue_request(50)).await.unwrap();
        let updated = h.ledger.adjust_balance(card.id, 10).await.unwrap();
        assert_eq!(updated.balance, 10);

        let ledger = h.ledger.clone();
        h.worker.shutdown().await;

        let failed = ledger.failed_notifications();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|f| f.attempts == 2));
        assert_eq!(ledger.get(card.id).await.unwrap().balance, 10);
    }
}
