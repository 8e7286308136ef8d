//! Manual Payment Engine
//!
//! Charges a prepaid NFC card when the card cannot be tapped, using one of
//! three credentials:
//!
//! | method | credential | lifetime | amount comes from |
//! |--------|------------|----------|-------------------|
//! | PIN    | 4-digit card PIN (argon2) | - | caller |
//! | code   | 8-digit one-time code via SMS | 10 min | stored code |
//! | OTP    | 6-digit approval OTP via SMS | 5 min | OTP metadata |
//!
//! Declines are returned as `Ok(Err(VerificationError))`; only infrastructure
//! failures surface as `Err`. Every verification writes one attempt row and
//! one audit row whatever the outcome.
//!
//! 카드 차감(및 코드/OTP 소비)이 원장 기록보다 먼저 일어난다. 원장 기록이
//! 실패하면 차감과 소비를 함께 되돌린다.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::types::Json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{
    CardRepository, ConsumedCredential, NfcCard, OtpCode, OtpMetadata, PaymentAuditEntry, PaymentCode, PaymentMethod,
    RedeemOutcome, VerificationLedger,
};
use crate::error::VerificationError;
use crate::services::ledger::{LedgerEntry, RecordedTransaction, TransactionRecorder};
use crate::services::security::{generate_numeric_code, mask_secret, verify_pin};
use crate::services::sms::SmsSender;
use crate::services::verification::{AttemptOutcome, AttemptSource, RateLimiter};
use crate::types::format_amount;

const PAYMENT_CODE_DIGITS: u32 = 8;
const PAYMENT_CODE_TTL_MINUTES: i64 = 10;
const OTP_DIGITS: u32 = 6;
const OTP_TTL_MINUTES: i64 = 5;
pub const OTP_PURPOSE: &str = "payment_approval";

/// 결제 요청 주체 (소매상 / 지점 / 클라이언트 정보)
#[derive(Debug, Clone)]
pub struct ChargeContext {
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ChargeContext {
    fn source(&self) -> AttemptSource {
        AttemptSource {
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeReceipt {
    pub success: bool,
    pub transaction_id: String,
    pub reference: String,
    pub method: PaymentMethod,
    pub amount: i64,
    pub balance: i64,
}

/// Issued code or OTP. The credential itself only travels by SMS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedCredential {
    pub success: bool,
    pub id: Uuid,
    pub method: PaymentMethod,
    pub amount: i64,
    pub expires_at: DateTime<Utc>,
    pub sms_sent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub payment_codes: u64,
    pub otps: u64,
    pub locks: u64,
}

enum FlowError {
    Rejected(VerificationError),
    Failed(anyhow::Error),
}

impl From<VerificationError> for FlowError {
    fn from(err: VerificationError) -> Self {
        FlowError::Rejected(err)
    }
}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        FlowError::Failed(err)
    }
}

type Flow<T> = std::result::Result<T, FlowError>;

/// Facts gathered along a flow, written to the audit row at the end.
#[derive(Default)]
struct AuditTrail {
    amount: Option<i64>,
    metadata: Map<String, Value>,
}

pub struct ManualPaymentEngine {
    cards: Arc<dyn CardRepository>,
    limiter: RateLimiter,
    ledger: Arc<dyn TransactionRecorder>,
    sms: Arc<dyn SmsSender>,
    clock: Arc<dyn Clock>,
    currency: String,
}

impl ManualPaymentEngine {
    pub fn new(
        cards: Arc<dyn CardRepository>,
        attempts: Arc<dyn VerificationLedger>,
        ledger: Arc<dyn TransactionRecorder>,
        sms: Arc<dyn SmsSender>,
        clock: Arc<dyn Clock>,
        currency: String,
    ) -> Self {
        Self {
            cards,
            limiter: RateLimiter::new(attempts, clock.clone()),
            ledger,
            sms,
            clock,
            currency,
        }
    }

    // ============ PIN ============

    pub async fn verify_pin_and_charge(
        &self,
        card_uid: &str,
        pin: &str,
        amount: i64,
        ctx: &ChargeContext,
    ) -> Result<std::result::Result<ChargeReceipt, VerificationError>> {
        let mut trail = AuditTrail {
            amount: Some(amount),
            ..Default::default()
        };
        let outcome = self.pin_flow(card_uid, pin, amount, ctx).await;
        self.settle(PaymentMethod::Pin, card_uid, pin, ctx, &mut trail, outcome)
            .await
    }

    async fn pin_flow(
        &self,
        card_uid: &str,
        pin: &str,
        amount: i64,
        ctx: &ChargeContext,
    ) -> Flow<ChargeReceipt> {
        self.limiter.check(card_uid).await??;
        if amount <= 0 {
            return Err(VerificationError::InvalidAmount.into());
        }
        let card = self.active_card(card_uid).await?;

        if !verify_pin(pin.to_string(), card.pin_hash.clone()).await? {
            return Err(VerificationError::InvalidPin.into());
        }
        if card.balance < amount {
            return Err(VerificationError::InsufficientBalance {
                balance: card.balance,
            }
            .into());
        }

        let Some(balance) = self.cards.debit_card(card.id, amount, self.clock.now()).await? else {
            let balance = self.current_balance(card_uid).await?;
            return Err(VerificationError::InsufficientBalance { balance }.into());
        };

        let recorded = self
            .post_charge(PaymentMethod::Pin, &card, amount, ctx, json!({}), None)
            .await?;
        Ok(receipt(PaymentMethod::Pin, recorded, amount, balance))
    }

    // ============ One-time code ============

    /// Issues an 8-digit code bound to `amount` and the calling retailer and
    /// texts it to `customer_phone`.
    pub async fn generate_payment_code(
        &self,
        card_uid: &str,
        amount: i64,
        customer_phone: &str,
        ctx: &ChargeContext,
    ) -> Result<std::result::Result<IssuedCredential, VerificationError>> {
        resolve(self.issue_code(card_uid, amount, customer_phone, ctx).await)
    }

    async fn issue_code(
        &self,
        card_uid: &str,
        amount: i64,
        customer_phone: &str,
        ctx: &ChargeContext,
    ) -> Flow<IssuedCredential> {
        let card = self.chargeable_card(card_uid, amount).await?;
        let now = self.clock.now();
        let code = PaymentCode {
            id: Uuid::new_v4(),
            card_id: card.id,
            code: generate_numeric_code(PAYMENT_CODE_DIGITS),
            amount,
            retailer_id: ctx.retailer_id,
            branch_id: ctx.branch_id,
            customer_phone: customer_phone.to_string(),
            expires_at: now + Duration::minutes(PAYMENT_CODE_TTL_MINUTES),
            is_used: false,
            used_at: None,
            created_at: now,
        };
        self.cards.insert_payment_code(&code).await?;

        let message = format!(
            "Your payment code is {} for {}. Valid for {} minutes.",
            code.code,
            format_amount(amount, &self.currency),
            PAYMENT_CODE_TTL_MINUTES
        );
        let sms_sent = self.notify(customer_phone, &message).await;

        tracing::info!(card_uid, code_id = %code.id, amount, sms_sent, "Payment code issued");
        Ok(IssuedCredential {
            success: true,
            id: code.id,
            method: PaymentMethod::Code,
            amount,
            expires_at: code.expires_at,
            sms_sent,
        })
    }

    pub async fn verify_code_and_charge(
        &self,
        card_uid: &str,
        code: &str,
        ctx: &ChargeContext,
    ) -> Result<std::result::Result<ChargeReceipt, VerificationError>> {
        let mut trail = AuditTrail::default();
        let outcome = self.code_flow(card_uid, code, ctx, &mut trail).await;
        self.settle(PaymentMethod::Code, card_uid, code, ctx, &mut trail, outcome)
            .await
    }

    async fn code_flow(
        &self,
        card_uid: &str,
        code: &str,
        ctx: &ChargeContext,
        trail: &mut AuditTrail,
    ) -> Flow<ChargeReceipt> {
        self.limiter.check(card_uid).await??;
        let card = self.active_card(card_uid).await?;
        let now = self.clock.now();

        let stored = self
            .cards
            .latest_payment_code(card.id, code)
            .await?
            .ok_or(VerificationError::InvalidCode)?;
        trail.amount = Some(stored.amount);
        trail.metadata.insert("code_id".into(), json!(stored.id));

        if stored.is_used {
            return Err(VerificationError::AlreadyUsed.into());
        }
        if stored.expires_at <= now {
            return Err(VerificationError::Expired.into());
        }
        if stored.retailer_id != ctx.retailer_id {
            return Err(VerificationError::RetailerMismatch.into());
        }
        if card.balance < stored.amount {
            return Err(VerificationError::InsufficientBalance {
                balance: card.balance,
            }
            .into());
        }

        let outcome = self
            .cards
            .redeem_payment_code(stored.id, card.id, stored.amount, self.clock.now())
            .await?;
        let balance = redeemed(card_uid, outcome)?;

        let recorded = self
            .post_charge(
                PaymentMethod::Code,
                &card,
                stored.amount,
                ctx,
                json!({ "code_id": stored.id }),
                Some(ConsumedCredential::PaymentCode(stored.id)),
            )
            .await?;
        Ok(receipt(PaymentMethod::Code, recorded, stored.amount, balance))
    }

    // ============ OTP ============

    /// Issues a 6-digit OTP carrying the card, amount and retailer in its
    /// metadata and texts it to `phone`.
    pub async fn request_payment_otp(
        &self,
        card_uid: &str,
        phone: &str,
        amount: i64,
        ctx: &ChargeContext,
    ) -> Result<std::result::Result<IssuedCredential, VerificationError>> {
        resolve(self.issue_otp(card_uid, phone, amount, ctx).await)
    }

    async fn issue_otp(
        &self,
        card_uid: &str,
        phone: &str,
        amount: i64,
        ctx: &ChargeContext,
    ) -> Flow<IssuedCredential> {
        let card = self.chargeable_card(card_uid, amount).await?;
        let now = self.clock.now();
        let otp = OtpCode {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            code: generate_numeric_code(OTP_DIGITS),
            purpose: OTP_PURPOSE.to_string(),
            expires_at: now + Duration::minutes(OTP_TTL_MINUTES),
            is_verified: false,
            verified_at: None,
            metadata: Json(OtpMetadata {
                card_uid: card.card_uid.clone(),
                card_id: card.id,
                amount,
                retailer_id: ctx.retailer_id,
                branch_id: ctx.branch_id,
            }),
            created_at: now,
        };
        self.cards.insert_otp(&otp).await?;

        let message = format!(
            "Approve payment of {} with code {}. Expires in {} minutes.",
            format_amount(amount, &self.currency),
            otp.code,
            OTP_TTL_MINUTES
        );
        let sms_sent = self.notify(phone, &message).await;

        tracing::info!(card_uid, otp_id = %otp.id, amount, sms_sent, "Payment OTP issued");
        Ok(IssuedCredential {
            success: true,
            id: otp.id,
            method: PaymentMethod::Otp,
            amount,
            expires_at: otp.expires_at,
            sms_sent,
        })
    }

    pub async fn verify_otp_and_charge(
        &self,
        card_uid: &str,
        phone: &str,
        otp: &str,
        ctx: &ChargeContext,
    ) -> Result<std::result::Result<ChargeReceipt, VerificationError>> {
        let mut trail = AuditTrail::default();
        trail.metadata.insert("phone".into(), json!(mask_secret(phone)));
        let outcome = self.otp_flow(card_uid, phone, otp, ctx, &mut trail).await;
        self.settle(PaymentMethod::Otp, card_uid, otp, ctx, &mut trail, outcome)
            .await
    }

    async fn otp_flow(
        &self,
        card_uid: &str,
        phone: &str,
        otp: &str,
        ctx: &ChargeContext,
        trail: &mut AuditTrail,
    ) -> Flow<ChargeReceipt> {
        self.limiter.check(card_uid).await??;
        let card = self.active_card(card_uid).await?;
        let now = self.clock.now();

        let stored = self
            .cards
            .latest_otp(phone, otp, OTP_PURPOSE)
            .await?
            .ok_or(VerificationError::InvalidCode)?;
        let meta = &stored.metadata.0;
        trail.amount = Some(meta.amount);
        trail.metadata.insert("otp_id".into(), json!(stored.id));

        if stored.is_verified {
            return Err(VerificationError::AlreadyUsed.into());
        }
        if stored.expires_at <= now {
            return Err(VerificationError::Expired.into());
        }
        // 다른 카드용 OTP는 존재하지 않는 코드로 취급
        if meta.card_id != card.id {
            return Err(VerificationError::InvalidCode.into());
        }
        if meta.retailer_id != ctx.retailer_id {
            return Err(VerificationError::RetailerMismatch.into());
        }
        if card.balance < meta.amount {
            return Err(VerificationError::InsufficientBalance {
                balance: card.balance,
            }
            .into());
        }

        let outcome = self
            .cards
            .redeem_otp(stored.id, card.id, meta.amount, self.clock.now())
            .await?;
        let balance = redeemed(card_uid, outcome)?;

        let recorded = self
            .post_charge(
                PaymentMethod::Otp,
                &card,
                meta.amount,
                ctx,
                json!({ "otp_id": stored.id }),
                Some(ConsumedCredential::Otp(stored.id)),
            )
            .await?;
        Ok(receipt(PaymentMethod::Otp, recorded, meta.amount, balance))
    }

    // ============ Maintenance ============

    /// Purges expired unused codes and OTPs and drops elapsed card locks.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        let now = self.clock.now();
        let report = CleanupReport {
            payment_codes: self.cards.purge_expired_payment_codes(now).await?,
            otps: self.cards.purge_expired_otps(now).await?,
            locks: self.limiter.release_expired_locks().await?,
        };
        tracing::info!(
            payment_codes = report.payment_codes,
            otps = report.otps,
            locks = report.locks,
            "Expired payment credentials cleaned up"
        );
        Ok(report)
    }

    // ============ Helpers ============

    async fn active_card(&self, card_uid: &str) -> Flow<NfcCard> {
        let card = self
            .cards
            .find_card_by_uid(card_uid)
            .await?
            .ok_or(VerificationError::CardNotFound)?;
        if !card.is_active {
            return Err(VerificationError::CardInactive.into());
        }
        Ok(card)
    }

    /// Card lookup used before issuing a code or OTP.
    async fn chargeable_card(&self, card_uid: &str, amount: i64) -> Flow<NfcCard> {
        self.limiter.check(card_uid).await??;
        if amount <= 0 {
            return Err(VerificationError::InvalidAmount.into());
        }
        let card = self.active_card(card_uid).await?;
        if card.balance < amount {
            return Err(VerificationError::InsufficientBalance {
                balance: card.balance,
            }
            .into());
        }
        Ok(card)
    }

    async fn current_balance(&self, card_uid: &str) -> Result<i64> {
        Ok(self
            .cards
            .find_card_by_uid(card_uid)
            .await?
            .map(|c| c.balance)
            .unwrap_or(0))
    }

    async fn record_charge(
        &self,
        method: PaymentMethod,
        card: &NfcCard,
        amount: i64,
        ctx: &ChargeContext,
        extra: Value,
    ) -> Result<RecordedTransaction> {
        let reference = format!(
            "NFC-{}-{}",
            method.as_str().to_uppercase(),
            Uuid::new_v4().simple()
        );
        self.ledger
            .record_transaction(&LedgerEntry {
                reference,
                amount,
                source: format!("card:{}", card.card_uid),
                destination: format!("retailer:{}", ctx.retailer_id),
                currency: self.currency.clone(),
                description: format!("Manual {} card payment", method.as_str()),
                metadata: json!({
                    "card_id": card.id,
                    "branch_id": ctx.branch_id,
                    "method": method,
                    "details": extra,
                }),
            })
            .await
    }

    /// Posts a charge already applied to the card. When the ledger rejects
    /// it the charge is reverted, so a card is never debited without a
    /// matching ledger transaction.
    async fn post_charge(
        &self,
        method: PaymentMethod,
        card: &NfcCard,
        amount: i64,
        ctx: &ChargeContext,
        extra: Value,
        credential: Option<ConsumedCredential>,
    ) -> Result<RecordedTransaction> {
        match self.record_charge(method, card, amount, ctx, extra).await {
            Ok(recorded) => Ok(recorded),
            Err(e) => {
                tracing::error!(
                    card_uid = %card.card_uid,
                    method = method.as_str(),
                    amount,
                    "Ledger posting failed, reverting charge: {:#}",
                    e
                );
                if let Err(revert) = self.cards.revert_charge(card.id, amount, credential).await {
                    tracing::error!(
                        card_uid = %card.card_uid,
                        amount,
                        "Charge revert failed: {:#}",
                        revert
                    );
                }
                Err(e)
            }
        }
    }

    /// SMS is best-effort; a failed send never fails issuance.
    async fn notify(&self, phone: &str, message: &str) -> bool {
        match self.sms.send(phone, message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(phone = %mask_secret(phone), "SMS delivery failed: {:#}", e);
                false
            }
        }
    }

    /// Writes the attempt and audit rows for a finished verification and
    /// converts the flow result into the public shape.
    async fn settle(
        &self,
        method: PaymentMethod,
        card_uid: &str,
        credential: &str,
        ctx: &ChargeContext,
        trail: &mut AuditTrail,
        outcome: Flow<ChargeReceipt>,
    ) -> Result<std::result::Result<ChargeReceipt, VerificationError>> {
        let (attempt, success, error_message, transaction_id) = match &outcome {
            Ok(receipt) => {
                trail.amount = Some(receipt.amount);
                trail
                    .metadata
                    .insert("reference".into(), json!(receipt.reference));
                (
                    AttemptOutcome::Succeeded,
                    true,
                    None,
                    Some(receipt.transaction_id.clone()),
                )
            }
            Err(FlowError::Rejected(err)) => (
                AttemptOutcome::Declined(err),
                false,
                Some(err.to_string()),
                None,
            ),
            Err(FlowError::Failed(e)) => (
                AttemptOutcome::Errored,
                false,
                Some(format!("Internal error: {}", e)),
                None,
            ),
        };

        if let Err(e) = self
            .limiter
            .record_attempt(card_uid, ctx.retailer_id, method, attempt, &ctx.source())
            .await
        {
            tracing::error!(card_uid, method = method.as_str(), "Failed to record attempt: {:#}", e);
        }

        let entry = PaymentAuditEntry {
            id: Uuid::new_v4(),
            card_uid: card_uid.to_string(),
            retailer_id: ctx.retailer_id,
            branch_id: ctx.branch_id,
            amount: trail.amount,
            method,
            masked_code: mask_secret(credential),
            success,
            error_message,
            transaction_id,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            metadata: Value::Object(std::mem::take(&mut trail.metadata)),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.cards.insert_audit_entry(&entry).await {
            tracing::error!(card_uid, method = method.as_str(), "Failed to write audit entry: {:#}", e);
        }

        match outcome {
            Ok(receipt) => {
                tracing::info!(
                    card_uid,
                    method = method.as_str(),
                    amount = %format_amount(receipt.amount, &self.currency),
                    transaction_id = %receipt.transaction_id,
                    "Card payment approved"
                );
                Ok(Ok(receipt))
            }
            Err(FlowError::Rejected(err)) => {
                tracing::warn!(
                    card_uid,
                    method = method.as_str(),
                    code = err.code(),
                    "Card payment declined"
                );
                Ok(Err(err))
            }
            Err(FlowError::Failed(e)) => Err(e),
        }
    }
}

fn receipt(
    method: PaymentMethod,
    recorded: RecordedTransaction,
    amount: i64,
    balance: i64,
) -> ChargeReceipt {
    ChargeReceipt {
        success: true,
        transaction_id: recorded.transaction_id,
        reference: recorded.reference,
        method,
        amount,
        balance,
    }
}

fn redeemed(card_uid: &str, outcome: RedeemOutcome) -> Flow<i64> {
    match outcome {
        RedeemOutcome::Charged { balance } => Ok(balance),
        RedeemOutcome::AlreadyConsumed => {
            tracing::debug!(card_uid, "Credential was consumed concurrently");
            Err(VerificationError::AlreadyUsed.into())
        }
        RedeemOutcome::InsufficientBalance { balance } => {
            Err(VerificationError::InsufficientBalance { balance }.into())
        }
    }
}

fn resolve<T>(outcome: Flow<T>) -> Result<std::result::Result<T, VerificationError>> {
    match outcome {
        Ok(value) => Ok(Ok(value)),
        Err(FlowError::Rejected(err)) => Ok(Err(err)),
        Err(FlowError::Failed(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::MemoryStore;
    use crate::services::ledger::fake::FakeLedger;
    use crate::services::security::hash_pin;
    use crate::services::sms::fake::FakeSms;
    use chrono::TimeZone;

    const CARD: &str = "04A1B2C3D4";
    const PHONE: &str = "+250788123456";

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<FakeLedger>,
        sms: Arc<FakeSms>,
        clock: Arc<ManualClock>,
        engine: ManualPaymentEngine,
        ctx: ChargeContext,
    }

    async fn harness(balance: i64) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let sms = Arc::new(FakeSms::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let engine = ManualPaymentEngine::new(
            store.clone(),
            store.clone(),
            ledger.clone(),
            sms.clone(),
            clock.clone(),
            "RWF".to_string(),
        );
        store
            .insert_card(&NfcCard {
                id: Uuid::new_v4(),
                card_uid: CARD.to_string(),
                balance,
                pin_hash: hash_pin("1234").unwrap(),
                is_active: true,
                customer_id: None,
                last_used_at: None,
                created_at: clock.now(),
            })
            .await
            .unwrap();
        let ctx = ChargeContext {
            retailer_id: Uuid::new_v4(),
            branch_id: None,
            ip_address: Some("10.0.0.7".to_string()),
            user_agent: Some("pos-terminal/2.1".to_string()),
        };
        Harness {
            store,
            ledger,
            sms,
            clock,
            engine,
            ctx,
        }
    }

    async fn balance(h: &Harness) -> i64 {
        h.store.find_card_by_uid(CARD).await.unwrap().unwrap().balance
    }

    /// Pulls the numeric credential out of the last SMS.
    fn sent_code(sms: &FakeSms, digits: usize) -> String {
        let (_, message) = sms.sent().last().cloned().unwrap();
        message
            .split(|c: char| !c.is_ascii_digit())
            .find(|token| token.len() == digits)
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_pin_charge_debits_and_audits() {
        let h = harness(100_000).await;
        let receipt = h
            .engine
            .verify_pin_and_charge(CARD, "1234", 10_000, &h.ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(receipt.balance, 90_000);
        assert_eq!(balance(&h).await, 90_000);
        assert_eq!(h.ledger.entries().len(), 1);

        let audit = h.store.audit_entries().unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].success);
        assert_eq!(audit[0].masked_code, "****");
        assert_eq!(audit[0].ip_address.as_deref(), Some("10.0.0.7"));
        assert!(h.store.attempts().unwrap()[0].success);
    }

    #[tokio::test]
    async fn test_fourth_attempt_sees_lock_even_with_correct_pin() {
        let h = harness(100_000).await;
        for _ in 0..3 {
            let result = h
                .engine
                .verify_pin_and_charge(CARD, "9999", 1_000, &h.ctx)
                .await
                .unwrap();
            assert_eq!(result, Err(VerificationError::InvalidPin));
        }

        let result = h
            .engine
            .verify_pin_and_charge(CARD, "1234", 1_000, &h.ctx)
            .await
            .unwrap();
        match result {
            Err(VerificationError::CardLocked { until }) => {
                assert_eq!(until, h.clock.now() + Duration::minutes(30));
            }
            other => panic!("expected CardLocked, got {:?}", other),
        }
        assert_eq!(balance(&h).await, 100_000);
        assert_eq!(h.store.audit_entries().unwrap().len(), 4);
        assert_eq!(h.store.attempts().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_insufficient_balance_does_not_count_toward_lock() {
        let h = harness(500).await;
        for _ in 0..4 {
            let result = h
                .engine
                .verify_pin_and_charge(CARD, "1234", 1_000, &h.ctx)
                .await
                .unwrap();
            assert_eq!(result, Err(VerificationError::InsufficientBalance { balance: 500 }));
        }
        assert!(h.store.locks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_card_is_declined_and_audited() {
        let h = harness(0).await;
        let result = h
            .engine
            .verify_pin_and_charge("UNKNOWN", "1234", 1_000, &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, Err(VerificationError::CardNotFound));
        assert_eq!(h.store.audit_entries().unwrap()[0].card_uid, "UNKNOWN");
    }

    #[tokio::test]
    async fn test_code_flow_charges_stored_amount_once() {
        let h = harness(100_000).await;
        let issued = h
            .engine
            .generate_payment_code(CARD, 25_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        assert!(issued.sms_sent);
        let code = sent_code(&h.sms, 8);

        let receipt = h
            .engine
            .verify_code_and_charge(CARD, &code, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receipt.amount, 25_000);
        assert_eq!(balance(&h).await, 75_000);
        assert!(h.store.payment_code(issued.id).unwrap().unwrap().is_used);

        let again = h
            .engine
            .verify_code_and_charge(CARD, &code, &h.ctx)
            .await
            .unwrap();
        assert_eq!(again, Err(VerificationError::AlreadyUsed));

        let audit = h.store.audit_entries().unwrap();
        assert_eq!(audit[0].masked_code, format!("****{}", &code[4..]));
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected_without_debit() {
        let h = harness(100_000).await;
        h.engine
            .generate_payment_code(CARD, 25_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let code = sent_code(&h.sms, 8);

        h.clock.advance(Duration::minutes(11));
        let result = h
            .engine
            .verify_code_and_charge(CARD, &code, &h.ctx)
            .await
            .unwrap();

        assert_eq!(result, Err(VerificationError::Expired));
        assert_eq!(balance(&h).await, 100_000);
        assert!(h.ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_code_from_other_retailer_is_rejected() {
        let h = harness(100_000).await;
        h.engine
            .generate_payment_code(CARD, 5_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let code = sent_code(&h.sms, 8);

        let other = ChargeContext {
            retailer_id: Uuid::new_v4(),
            ..h.ctx.clone()
        };
        let result = h
            .engine
            .verify_code_and_charge(CARD, &code, &other)
            .await
            .unwrap();
        assert_eq!(result, Err(VerificationError::RetailerMismatch));
        assert_eq!(balance(&h).await, 100_000);
    }

    #[tokio::test]
    async fn test_concurrent_code_redemption_debits_once() {
        let h = harness(100_000).await;
        h.engine
            .generate_payment_code(CARD, 30_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let code = sent_code(&h.sms, 8);
        h.ledger.simulate_latency(true);

        let (a, b) = tokio::join!(
            h.engine.verify_code_and_charge(CARD, &code, &h.ctx),
            h.engine.verify_code_and_charge(CARD, &code, &h.ctx)
        );
        let approved = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|r| r.is_ok())
            .count();

        assert_eq!(approved, 1);
        assert_eq!(balance(&h).await, 70_000);
        assert_eq!(h.ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_failure_reverts_pin_charge() {
        let h = harness(100_000).await;
        h.ledger.fail_all(true);

        let result = h
            .engine
            .verify_pin_and_charge(CARD, "1234", 10_000, &h.ctx)
            .await;

        assert!(result.is_err());
        assert_eq!(balance(&h).await, 100_000);
        let audit = h.store.audit_entries().unwrap();
        assert!(!audit[0].success);
        assert!(audit[0].transaction_id.is_none());
    }

    #[tokio::test]
    async fn test_ledger_failure_reopens_payment_code() {
        let h = harness(100_000).await;
        let issued = h
            .engine
            .generate_payment_code(CARD, 20_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let code = sent_code(&h.sms, 8);

        h.ledger.fail_all(true);
        assert!(h.engine.verify_code_and_charge(CARD, &code, &h.ctx).await.is_err());
        assert_eq!(balance(&h).await, 100_000);
        assert!(!h.store.payment_code(issued.id).unwrap().unwrap().is_used);

        // 원장 복구 후 같은 코드로 재시도 가능
        h.ledger.fail_all(false);
        let receipt = h
            .engine
            .verify_code_and_charge(CARD, &code, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receipt.balance, 80_000);
        assert_eq!(h.ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_card_is_declined_for_every_method() {
        let h = harness(100_000).await;
        h.engine
            .generate_payment_code(CARD, 5_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let code = sent_code(&h.sms, 8);
        h.engine
            .request_payment_otp(CARD, PHONE, 5_000, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let otp = sent_code(&h.sms, 6);
        h.store.set_card_active(CARD, false).unwrap();

        let pin = h
            .engine
            .verify_pin_and_charge(CARD, "1234", 5_000, &h.ctx)
            .await
            .unwrap();
        let by_code = h
            .engine
            .verify_code_and_charge(CARD, &code, &h.ctx)
            .await
            .unwrap();
        let by_otp = h
            .engine
            .verify_otp_and_charge(CARD, PHONE, &otp, &h.ctx)
            .await
            .unwrap();

        assert_eq!(pin, Err(VerificationError::CardInactive));
        assert_eq!(by_code, Err(VerificationError::CardInactive));
        assert_eq!(by_otp, Err(VerificationError::CardInactive));
        assert_eq!(balance(&h).await, 100_000);
        assert!(h.ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_sms_failure_does_not_block_issuance() {
        let h = harness(100_000).await;
        h.sms.fail_all(true);
        let issued = h
            .engine
            .generate_payment_code(CARD, 5_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        assert!(!issued.sms_sent);
        assert!(h.store.payment_code(issued.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_otp_flow() {
        let h = harness(100_000).await;
        let issued = h
            .engine
            .request_payment_otp(CARD, PHONE, 12_000, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let otp = sent_code(&h.sms, 6);

        let wrong_phone = h
            .engine
            .verify_otp_and_charge(CARD, "+250700000000", &otp, &h.ctx)
            .await
            .unwrap();
        assert_eq!(wrong_phone, Err(VerificationError::InvalidCode));

        let receipt = h
            .engine
            .verify_otp_and_charge(CARD, PHONE, &otp, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receipt.amount, 12_000);
        assert_eq!(receipt.method, PaymentMethod::Otp);
        assert_eq!(balance(&h).await, 88_000);
        assert!(h.store.otp(issued.id).unwrap().unwrap().is_verified);

        let replay = h
            .engine
            .verify_otp_and_charge(CARD, PHONE, &otp, &h.ctx)
            .await
            .unwrap();
        assert_eq!(replay, Err(VerificationError::AlreadyUsed));
        assert_eq!(balance(&h).await, 88_000);
        assert_eq!(h.ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_otp_from_other_retailer_is_rejected() {
        let h = harness(100_000).await;
        h.engine
            .request_payment_otp(CARD, PHONE, 7_000, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let otp = sent_code(&h.sms, 6);

        let other = ChargeContext {
            retailer_id: Uuid::new_v4(),
            ..h.ctx.clone()
        };
        let result = h
            .engine
            .verify_otp_and_charge(CARD, PHONE, &otp, &other)
            .await
            .unwrap();
        assert_eq!(result, Err(VerificationError::RetailerMismatch));
        assert_eq!(balance(&h).await, 100_000);
    }

    #[tokio::test]
    async fn test_otp_expires_after_five_minutes() {
        let h = harness(100_000).await;
        h.engine
            .request_payment_otp(CARD, PHONE, 1_000, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        let otp = sent_code(&h.sms, 6);

        h.clock.advance(Duration::minutes(5));
        let result = h
            .engine
            .verify_otp_and_charge(CARD, PHONE, &otp, &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, Err(VerificationError::Expired));
    }

    #[tokio::test]
    async fn test_cleanup_purges_expired_credentials() {
        let h = harness(100_000).await;
        h.engine
            .generate_payment_code(CARD, 1_000, PHONE, &h.ctx)
            .await
            .unwrap()
            .unwrap();
        h.engine
            .request_payment_otp(CARD, PHONE, 1_000, &h.ctx)
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::minutes(11));
        let report = h.engine.cleanup_expired().await.unwrap();
        assert_eq!(report.payment_codes, 1);
        assert_eq!(report.otps, 1);
        assert_eq!(report.locks, 0);
    }
}
