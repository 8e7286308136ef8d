//! Repository Interfaces
//!
//! 서비스는 `Database`를 직접 받지 않고 아래의 좁은 trait만 의존한다.
//! PostgreSQL 구현은 `db/mod.rs`, `db/payments.rs`에,
//! 인메모리 구현은 `db/memory.rs`에 있다.
//!
//! Concurrency control lives in the implementations: every state change is a
//! conditional update keyed on the expected prior state (`status = 'held'`,
//! `balance >= amount`, `is_used = FALSE`), so callers never read-then-write.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    AutoDeductionSetting, CardLock, ConsumedCredential, DebtTotals, EscrowRepayment, EscrowStatus,
    EscrowTransaction, NfcCard, OtpCode, PaymentAuditEntry, PaymentCode, RedeemOutcome,
    RepaymentMethod, VerificationAttempt,
};

/// Liveness check for the backing store (used by `/health`).
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn health_check(&self) -> Result<()>;
}

/// 에스크로 / 상환 / 자동 공제 설정 저장소
#[async_trait]
pub trait EscrowRepository: Send + Sync {
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> Result<()>;

    async fn find_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>>;

    /// `status = held AND auto_release_at <= now`
    async fn find_held_escrows_past_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>>;

    /// Compare-and-swap on status. Returns `None` when the row is missing or
    /// no longer in `from`.
    async fn transition_escrow(
        &self,
        id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowTransaction>>;

    /// Released/expired escrow total and completed repayment total, read in
    /// a single snapshot.
    async fn settled_debt_totals(&self, retailer_id: Uuid) -> Result<DebtTotals>;

    /// Completed repayments of `method` created at or after `since`.
    async fn sum_repayments_since(
        &self,
        retailer_id: Uuid,
        method: RepaymentMethod,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Oldest released/expired escrow, the target for automatic repayments.
    async fn oldest_settled_escrow(&self, retailer_id: Uuid) -> Result<Option<EscrowTransaction>>;

    async fn insert_repayment(&self, repayment: &EscrowRepayment) -> Result<()>;

    async fn enabled_auto_deductions(&self) -> Result<Vec<AutoDeductionSetting>>;

    async fn find_auto_deduction(&self, retailer_id: Uuid) -> Result<Option<AutoDeductionSetting>>;

    /// Insert or update keyed on `retailer_id`; `created_at` of an existing row
    /// is preserved.
    async fn upsert_auto_deduction(
        &self,
        setting: &AutoDeductionSetting,
    ) -> Result<AutoDeductionSetting>;
}

/// 소매상 지갑 (자동 공제 대상 잔액)
#[async_trait]
pub trait RetailerWallet: Send + Sync {
    async fn wallet_balance(&self, retailer_id: Uuid) -> Result<Option<i64>>;

    /// Debits `repayment.repayment_amount` from the retailer's wallet and
    /// inserts the repayment as one unit. The debit only applies when
    /// `balance >= amount`. Returns the new balance, or `None` (nothing
    /// written) when the wallet is missing or short.
    async fn debit_wallet_for_repayment(
        &self,
        repayment: &EscrowRepayment,
    ) -> Result<Option<i64>>;
}

/// 카드 / 결제 코드 / OTP / 감사 로그 저장소
#[async_trait]
pub trait CardRepository: Send + Sync {
    async fn insert_card(&self, card: &NfcCard) -> Result<()>;

    async fn find_card_by_uid(&self, card_uid: &str) -> Result<Option<NfcCard>>;

    /// Conditional debit (`balance >= amount AND is_active`), stamping
    /// `last_used_at`. Returns the new balance or `None`.
    async fn debit_card(&self, card_id: Uuid, amount: i64, now: DateTime<Utc>)
        -> Result<Option<i64>>;

    async fn insert_payment_code(&self, code: &PaymentCode) -> Result<()>;

    /// Most recent code row for `(card_id, code)`.
    async fn latest_payment_code(&self, card_id: Uuid, code: &str) -> Result<Option<PaymentCode>>;

    /// Marks the code used and debits the card as one unit.
    async fn redeem_payment_code(
        &self,
        code_id: Uuid,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome>;

    async fn insert_otp(&self, otp: &OtpCode) -> Result<()>;

    /// Most recent OTP row for `(phone, code, purpose)`.
    async fn latest_otp(&self, phone: &str, code: &str, purpose: &str) -> Result<Option<OtpCode>>;

    /// Marks the OTP verified and debits the card as one unit.
    async fn redeem_otp(
        &self,
        otp_id: Uuid,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome>;

    /// Undoes a charge that could not be posted to the ledger: credits
    /// `amount` back to the card and re-opens the consumed credential.
    async fn revert_charge(
        &self,
        card_id: Uuid,
        amount: i64,
        credential: Option<ConsumedCredential>,
    ) -> Result<()>;

    async fn purge_expired_payment_codes(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn purge_expired_otps(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn insert_audit_entry(&self, entry: &PaymentAuditEntry) -> Result<()>;
}

/// 카드별 검증 실패 횟수와 잠금 상태
#[async_trait]
pub trait VerificationLedger: Send + Sync {
    async fn record_attempt(&self, attempt: &VerificationAttempt) -> Result<()>;

    /// Failed attempts flagged `counts_toward_lockout` since `since`.
    async fn count_recent_failures(&self, card_uid: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Lock with the latest `locked_until > now`, if any.
    async fn active_lock(&self, card_uid: &str, now: DateTime<Utc>) -> Result<Option<CardLock>>;

    async fn insert_lock(&self, lock: &CardLock) -> Result<()>;

    /// Deletes locks whose duration has elapsed. Returns how many were removed.
    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64>;
}
