//! Failed-attempt lockout for card credentials.
//!
//! 15분 안에 잠금 대상 실패가 3회 쌓이면 카드를 30분간 잠근다.
//! 시도와 잠금은 `card_uid` 기준이므로 존재하지 않는 카드에도 적용된다.

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{CardLock, PaymentMethod, VerificationAttempt, VerificationLedger};
use crate::error::VerificationError;

pub const MAX_FAILED_ATTEMPTS: i64 = 3;
pub const LOCKOUT_WINDOW_MINUTES: i64 = 15;
pub const LOCK_DURATION_MINUTES: i64 = 30;
const LOCK_REASON: &str = "Exceeded maximum failed attempts";

/// Caller metadata stored with every attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptSource {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// What happened to one verification attempt.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    Succeeded,
    Declined(&'a VerificationError),
    /// Infrastructure failure; recorded but never counted.
    Errored,
}

pub struct RateLimiter {
    ledger: Arc<dyn VerificationLedger>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(ledger: Arc<dyn VerificationLedger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// Pre-check run before any credential is examined.
    pub async fn check(&self, card_uid: &str) -> Result<Result<(), VerificationError>> {
        let now = self.clock.now();

        if let Some(lock) = self.ledger.active_lock(card_uid, now).await? {
            return Ok(Err(VerificationError::CardLocked {
                until: lock.locked_until,
            }));
        }

        let since = now - Duration::minutes(LOCKOUT_WINDOW_MINUTES);
        let failures = self.ledger.count_recent_failures(card_uid, since).await?;
        if failures >= MAX_FAILED_ATTEMPTS {
            let lock = self.lock_card(card_uid).await?;
            return Ok(Err(VerificationError::TooManyAttempts {
                until: lock.locked_until,
            }));
        }

        Ok(Ok(()))
    }

    /// Appends an attempt row. Failures that count toward lockout are
    /// re-counted afterwards and lock the card as soon as the limit is hit.
    pub async fn record_attempt(
        &self,
        card_uid: &str,
        retailer_id: Uuid,
        method: PaymentMethod,
        outcome: AttemptOutcome<'_>,
        source: &AttemptSource,
    ) -> Result<()> {
        let now = self.clock.now();
        let (success, counts, reason) = match outcome {
            AttemptOutcome::Succeeded => (true, false, None),
            AttemptOutcome::Declined(err) => {
                (false, err.counts_toward_lockout(), Some(err.code().to_string()))
            }
            AttemptOutcome::Errored => (false, false, Some("internal_error".to_string())),
        };

        self.ledger
            .record_attempt(&VerificationAttempt {
                id: Uuid::new_v4(),
                card_uid: card_uid.to_string(),
                retailer_id,
                method,
                success,
                counts_toward_lockout: counts,
                failure_reason: reason,
                ip_address: source.ip_address.clone(),
                user_agent: source.user_agent.clone(),
                created_at: now,
            })
            .await?;

        if counts {
            let since = now - Duration::minutes(LOCKOUT_WINDOW_MINUTES);
            let failures = self.ledger.count_recent_failures(card_uid, since).await?;
            if failures >= MAX_FAILED_ATTEMPTS
                && self.ledger.active_lock(card_uid, now).await?.is_none()
            {
                self.lock_card(card_uid).await?;
            }
        }
        Ok(())
    }

    pub async fn release_expired_locks(&self) -> Result<u64> {
        self.ledger.release_expired_locks(self.clock.now()).await
    }

    async fn lock_card(&self, card_uid: &str) -> Result<CardLock> {
        let now = self.clock.now();
        let lock = CardLock {
            id: Uuid::new_v4(),
            card_uid: card_uid.to_string(),
            locked_at: now,
            locked_until: now + Duration::minutes(LOCK_DURATION_MINUTES),
            reason: LOCK_REASON.to_string(),
        };
        self.ledger.insert_lock(&lock).await?;
        tracing::warn!(
            card_uid,
            locked_until = %lock.locked_until,
            "Card locked after repeated failed verifications"
        );
        Ok(lock)
    }
}
