//! PostgreSQL implementation of the card payment and verification stores.
//!
//! 코드/OTP 소비와 카드 차감은 하나의 트랜잭션으로 묶는다.
//! 둘 중 하나라도 실패하면 전체 롤백.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{
    CardLock, CardRepository, ConsumedCredential, Database, NfcCard, OtpCode, PaymentAuditEntry, PaymentCode,
    RedeemOutcome, VerificationAttempt, VerificationLedger,
};

const CARD_COLUMNS: &str =
    "id, card_uid, balance, pin_hash, is_active, customer_id, last_used_at, created_at";

const CODE_COLUMNS: &str = r#"
    id, card_id, code, amount, retailer_id, branch_id, customer_phone,
    expires_at, is_used, used_at, created_at
"#;

const OTP_COLUMNS: &str =
    "id, phone, code, purpose, expires_at, is_verified, verified_at, metadata, created_at";

/// Debits the card inside an open transaction, committing or rolling back
/// depending on whether the balance covered the amount.
async fn debit_within(
    mut tx: Transaction<'_, Postgres>,
    card_id: Uuid,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<RedeemOutcome> {
    let debited: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE nfc_cards
        SET balance = balance - $2, last_used_at = $3
        WHERE id = $1 AND is_active = TRUE AND balance >= $2
        RETURNING balance
        "#,
    )
    .bind(card_id)
    .bind(amount)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    match debited {
        Some((balance,)) => {
            tx.commit().await?;
            Ok(RedeemOutcome::Charged { balance })
        }
        None => {
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT balance FROM nfc_cards WHERE id = $1")
                    .bind(card_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            Ok(RedeemOutcome::InsufficientBalance {
                balance: current.map(|c| c.0).unwrap_or(0),
            })
        }
    }
}

#[async_trait]
impl CardRepository for Database {
    async fn insert_card(&self, card: &NfcCard) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nfc_cards (
                id, card_uid, balance, pin_hash, is_active, customer_id, last_used_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(card.id)
        .bind(&card.card_uid)
        .bind(card.balance)
        .bind(&card.pin_hash)
        .bind(card.is_active)
        .bind(card.customer_id)
        .bind(card.last_used_at)
        .bind(card.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn find_card_by_uid(&self, card_uid: &str) -> Result<Option<NfcCard>> {
        let card = sqlx::query_as::<_, NfcCard>(&format!(
            "SELECT {CARD_COLUMNS} FROM nfc_cards WHERE card_uid = $1"
        ))
        .bind(card_uid)
        .fetch_optional(self.pool())
        .await?;

        Ok(card)
    }

    async fn debit_card(
        &self,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let balance: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE nfc_cards
            SET balance = balance - $2, last_used_at = $3
            WHERE id = $1 AND is_active = TRUE AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(card_id)
        .bind(amount)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        Ok(balance.map(|b| b.0))
    }

    async fn insert_payment_code(&self, code: &PaymentCode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_codes (
                id, card_id, code, amount, retailer_id, branch_id, customer_phone,
                expires_at, is_used, used_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(code.id)
        .bind(code.card_id)
        .bind(&code.code)
        .bind(code.amount)
        .bind(code.retailer_id)
        .bind(code.branch_id)
        .bind(&code.customer_phone)
        .bind(code.expires_at)
        .bind(code.is_used)
        .bind(code.used_at)
        .bind(code.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn latest_payment_code(&self, card_id: Uuid, code: &str) -> Result<Option<PaymentCode>> {
        let found = sqlx::query_as::<_, PaymentCode>(&format!(
            r#"
            SELECT {CODE_COLUMNS}
            FROM payment_codes
            WHERE card_id = $1 AND code = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(card_id)
        .bind(code)
        .fetch_optional(self.pool())
        .await?;

        Ok(found)
    }

    async fn redeem_payment_code(
        &self,
        code_id: Uuid,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome> {
        let mut tx = self.pool().begin().await?;

        let marked = sqlx::query(
            "UPDATE payment_codes SET is_used = TRUE, used_at = $2 WHERE id = $1 AND is_used = FALSE",
        )
        .bind(code_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked == 0 {
            tx.rollback().await?;
            return Ok(RedeemOutcome::AlreadyConsumed);
        }

        debit_within(tx, card_id, amount, now).await
    }

    async fn insert_otp(&self, otp: &OtpCode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO otp_codes (
                id, phone, code, purpose, expires_at, is_verified, verified_at, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(otp.id)
        .bind(&otp.phone)
        .bind(&otp.code)
        .bind(&otp.purpose)
        .bind(otp.expires_at)
        .bind(otp.is_verified)
        .bind(otp.verified_at)
        .bind(&otp.metadata)
        .bind(otp.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn latest_otp(&self, phone: &str, code: &str, purpose: &str) -> Result<Option<OtpCode>> {
        let found = sqlx::query_as::<_, OtpCode>(&format!(
            r#"
            SELECT {OTP_COLUMNS}
            FROM otp_codes
            WHERE phone = $1 AND code = $2 AND purpose = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(phone)
        .bind(code)
        .bind(purpose)
        .fetch_optional(self.pool())
        .await?;

        Ok(found)
    }

    async fn redeem_otp(
        &self,
        otp_id: Uuid,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome> {
        let mut tx = self.pool().begin().await?;

        let marked = sqlx::query(
            "UPDATE otp_codes SET is_verified = TRUE, verified_at = $2 WHERE id = $1 AND is_verified = FALSE",
        )
        .bind(otp_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked == 0 {
            tx.rollback().await?;
            return Ok(RedeemOutcome::AlreadyConsumed);
        }

        debit_within(tx, card_id, amount, now).await
    }

    async fn revert_charge(
        &self,
        card_id: Uuid,
        amount: i64,
        credential: Option<ConsumedCredential>,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("UPDATE nfc_cards SET balance = balance + $2 WHERE id = $1")
            .bind(card_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        match credential {
            Some(ConsumedCredential::PaymentCode(id)) => {
                sqlx::query("UPDATE payment_codes SET is_used = FALSE, used_at = NULL WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(ConsumedCredential::Otp(id)) => {
                sqlx::query("UPDATE otp_codes SET is_verified = FALSE, verified_at = NULL WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }

        tx.commit().await?;
        Ok(())
    }

    async fn purge_expired_payment_codes(&self, now: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM payment_codes WHERE expires_at < $1 AND is_used = FALSE")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(purged)
    }

    async fn purge_expired_otps(&self, now: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM otp_codes WHERE expires_at < $1 AND is_verified = FALSE")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(purged)
    }

    async fn insert_audit_entry(&self, entry: &PaymentAuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_audit_log (
                id, card_uid, retailer_id, branch_id, amount, method, masked_code, success,
                error_message, transaction_id, ip_address, user_agent, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.card_uid)
        .bind(entry.retailer_id)
        .bind(entry.branch_id)
        .bind(entry.amount)
        .bind(entry.method)
        .bind(&entry.masked_code)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(&entry.transaction_id)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl VerificationLedger for Database {
    async fn record_attempt(&self, attempt: &VerificationAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_attempts (
                id, card_uid, retailer_id, method, success, counts_toward_lockout,
                failure_reason, ip_address, user_agent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.card_uid)
        .bind(attempt.retailer_id)
        .bind(attempt.method)
        .bind(attempt.success)
        .bind(attempt.counts_toward_lockout)
        .bind(&attempt.failure_reason)
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(attempt.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn count_recent_failures(&self, card_uid: &str, since: DateTime<Utc>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM verification_attempts
            WHERE card_uid = $1
              AND success = FALSE
              AND counts_toward_lockout = TRUE
              AND created_at > $2
            "#,
        )
        .bind(card_uid)
        .bind(since)
        .fetch_one(self.pool())
        .await?;

        Ok(count.0)
    }

    async fn active_lock(&self, card_uid: &str, now: DateTime<Utc>) -> Result<Option<CardLock>> {
        let lock = sqlx::query_as::<_, CardLock>(
            r#"
            SELECT id, card_uid, locked_at, locked_until, reason
            FROM card_locks
            WHERE card_uid = $1 AND locked_until > $2
            ORDER BY locked_until DESC
            LIMIT 1
            "#,
        )
        .bind(card_uid)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        Ok(lock)
    }

    async fn insert_lock(&self, lock: &CardLock) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO card_locks (id, card_uid, locked_at, locked_until, reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(lock.id)
        .bind(&lock.card_uid)
        .bind(lock.locked_at)
        .bind(lock.locked_until)
        .bind(&lock.reason)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let released = sqlx::query("DELETE FROM card_locks WHERE locked_until <= $1")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(released)
    }
}
