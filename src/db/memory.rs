//! In-memory implementation of every repository trait.
//!
//! 테스트와 로컬 실행용. 하나의 Mutex로 전체 상태를 보호하므로
//! 조건부 업데이트와 "코드 소비 + 차감" 단위가 PostgreSQL 구현과
//! 같은 원자성을 가진다.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    AutoDeductionSetting, CardLock, CardRepository, ConsumedCredential, DebtTotals, EscrowRepayment,
    EscrowRepository, EscrowStatus, EscrowTransaction, NfcCard, OtpCode, PaymentAuditEntry,
    PaymentCode, RedeemOutcome, RepaymentMethod, RepaymentStatus, RetailerWallet, StoreHealth,
    VerificationAttempt, VerificationLedger,
};

#[derive(Default)]
struct State {
    escrows: HashMap<Uuid, EscrowTransaction>,
    repayments: Vec<EscrowRepayment>,
    settings: HashMap<Uuid, AutoDeductionSetting>,
    wallets: HashMap<Uuid, i64>,
    cards: HashMap<Uuid, NfcCard>,
    payment_codes: Vec<PaymentCode>,
    otps: Vec<OtpCode>,
    attempts: Vec<VerificationAttempt>,
    locks: Vec<CardLock>,
    audit: Vec<PaymentAuditEntry>,
}

impl State {
    fn debit(&mut self, card_id: Uuid, amount: i64, now: DateTime<Utc>) -> Option<i64> {
        let card = self.cards.get_mut(&card_id)?;
        if !card.is_active || card.balance < amount {
            return None;
        }
        card.balance -= amount;
        card.last_used_at = Some(now);
        Some(card.balance)
    }

    fn balance_of(&self, card_id: Uuid) -> i64 {
        self.cards.get(&card_id).map(|c| c.balance).unwrap_or(0)
    }
}

/// 인메모리 저장소
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Sets (or creates) a retailer wallet balance.
    pub fn set_wallet_balance(&self, retailer_id: Uuid, balance: i64) -> Result<()> {
        self.state()?.wallets.insert(retailer_id, balance);
        Ok(())
    }

    pub fn set_card_active(&self, card_uid: &str, active: bool) -> Result<()> {
        let mut state = self.state()?;
        let card = state
            .cards
            .values_mut()
            .find(|c| c.card_uid == card_uid)
            .ok_or_else(|| anyhow!("card uid {} does not exist", card_uid))?;
        card.is_active = active;
        Ok(())
    }

    pub fn repayments(&self) -> Result<Vec<EscrowRepayment>> {
        Ok(self.state()?.repayments.clone())
    }

    pub fn payment_code(&self, id: Uuid) -> Result<Option<PaymentCode>> {
        Ok(self.state()?.payment_codes.iter().find(|c| c.id == id).cloned())
    }

    pub fn otp(&self, id: Uuid) -> Result<Option<OtpCode>> {
        Ok(self.state()?.otps.iter().find(|o| o.id == id).cloned())
    }

    pub fn attempts(&self) -> Result<Vec<VerificationAttempt>> {
        Ok(self.state()?.attempts.clone())
    }

    pub fn audit_entries(&self) -> Result<Vec<PaymentAuditEntry>> {
        Ok(self.state()?.audit.clone())
    }

    pub fn locks(&self) -> Result<Vec<CardLock>> {
        Ok(self.state()?.locks.clone())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        self.state().map(|_| ())
    }
}

#[async_trait]
impl EscrowRepository for MemoryStore {
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> Result<()> {
        let mut state = self.state()?;
        if state.escrows.contains_key(&escrow.id) {
            return Err(anyhow!("escrow {} already exists", escrow.id));
        }
        state.escrows.insert(escrow.id, escrow.clone());
        Ok(())
    }

    async fn find_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>> {
        Ok(self.state()?.escrows.get(&id).cloned())
    }

    async fn find_held_escrows_past_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>> {
        let state = self.state()?;
        let mut due: Vec<_> = state
            .escrows
            .values()
            .filter(|e| e.status == EscrowStatus::Held && e.auto_release_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.auto_release_at);
        Ok(due)
    }

    async fn transition_escrow(
        &self,
        id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowTransaction>> {
        let mut state = self.state()?;
        match state.escrows.get_mut(&id) {
            Some(escrow) if escrow.status == from => {
                escrow.status = to;
                escrow.updated_at = now;
                Ok(Some(escrow.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn settled_debt_totals(&self, retailer_id: Uuid) -> Result<DebtTotals> {
        let state = self.state()?;
        let total_debt = state
            .escrows
            .values()
            .filter(|e| e.retailer_id == retailer_id && e.status.is_settled())
            .map(|e| e.escrow_amount)
            .sum();
        let total_repaid = state
            .repayments
            .iter()
            .filter(|r| r.retailer_id == retailer_id && r.status == RepaymentStatus::Completed)
            .map(|r| r.repayment_amount)
            .sum();
        Ok(DebtTotals {
            total_debt,
            total_repaid,
        })
    }

    async fn sum_repayments_since(
        &self,
        retailer_id: Uuid,
        method: RepaymentMethod,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self
            .state()?
            .repayments
            .iter()
            .filter(|r| {
                r.retailer_id == retailer_id
                    && r.repayment_method == method
                    && r.status == RepaymentStatus::Completed
                    && r.created_at >= since
            })
            .map(|r| r.repayment_amount)
            .sum())
    }

    async fn oldest_settled_escrow(&self, retailer_id: Uuid) -> Result<Option<EscrowTransaction>> {
        Ok(self
            .state()?
            .escrows
            .values()
            .filter(|e| e.retailer_id == retailer_id && e.status.is_settled())
            .min_by_key(|e| e.created_at)
            .cloned())
    }

    async fn insert_repayment(&self, repayment: &EscrowRepayment) -> Result<()> {
        let mut state = self.state()?;
        if !state.escrows.contains_key(&repayment.escrow_transaction_id) {
            return Err(anyhow!(
                "escrow {} does not exist",
                repayment.escrow_transaction_id
            ));
        }
        state.repayments.push(repayment.clone());
        Ok(())
    }

    async fn enabled_auto_deductions(&self) -> Result<Vec<AutoDeductionSetting>> {
        let state = self.state()?;
        let mut enabled: Vec<_> = state.settings.values().filter(|s| s.enabled).cloned().collect();
        enabled.sort_by_key(|s| s.retailer_id);
        Ok(enabled)
    }

    async fn find_auto_deduction(&self, retailer_id: Uuid) -> Result<Option<AutoDeductionSetting>> {
        Ok(self.state()?.settings.get(&retailer_id).cloned())
    }

    async fn upsert_auto_deduction(
        &self,
        setting: &AutoDeductionSetting,
    ) -> Result<AutoDeductionSetting> {
        let mut state = self.state()?;
        let mut saved = setting.clone();
        if let Some(existing) = state.settings.get(&setting.retailer_id) {
            saved.created_at = existing.created_at;
        }
        state.settings.insert(saved.retailer_id, saved.clone());
        Ok(saved)
    }
}

#[async_trait]
impl RetailerWallet for MemoryStore {
    async fn wallet_balance(&self, retailer_id: Uuid) -> Result<Option<i64>> {
        Ok(self.state()?.wallets.get(&retailer_id).copied())
    }

    async fn debit_wallet_for_repayment(
        &self,
        repayment: &EscrowRepayment,
    ) -> Result<Option<i64>> {
        let mut state = self.state()?;
        if !state.escrows.contains_key(&repayment.escrow_transaction_id) {
            return Err(anyhow!(
                "escrow {} does not exist",
                repayment.escrow_transaction_id
            ));
        }
        let balance = match state.wallets.get_mut(&repayment.retailer_id) {
            Some(balance) if *balance >= repayment.repayment_amount => {
                *balance -= repayment.repayment_amount;
                *balance
            }
            _ => return Ok(None),
        };
        state.repayments.push(repayment.clone());
        Ok(Some(balance))
    }
}

#[async_trait]
impl CardRepository for MemoryStore {
    async fn insert_card(&self, card: &NfcCard) -> Result<()> {
        let mut state = self.state()?;
        if state.cards.values().any(|c| c.card_uid == card.card_uid) {
            return Err(anyhow!("card uid {} already exists", card.card_uid));
        }
        state.cards.insert(card.id, card.clone());
        Ok(())
    }

    async fn find_card_by_uid(&self, card_uid: &str) -> Result<Option<NfcCard>> {
        Ok(self
            .state()?
            .cards
            .values()
            .find(|c| c.card_uid == card_uid)
            .cloned())
    }

    async fn debit_card(
        &self,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        Ok(self.state()?.debit(card_id, amount, now))
    }

    async fn insert_payment_code(&self, code: &PaymentCode) -> Result<()> {
        self.state()?.payment_codes.push(code.clone());
        Ok(())
    }

    async fn latest_payment_code(&self, card_id: Uuid, code: &str) -> Result<Option<PaymentCode>> {
        Ok(self
            .state()?
            .payment_codes
            .iter()
            .filter(|c| c.card_id == card_id && c.code == code)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn redeem_payment_code(
        &self,
        code_id: Uuid,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome> {
        let mut state = self.state()?;

        let Some(index) = state
            .payment_codes
            .iter()
            .position(|c| c.id == code_id && !c.is_used)
        else {
            return Ok(RedeemOutcome::AlreadyConsumed);
        };

        match state.debit(card_id, amount, now) {
            Some(balance) => {
                let code = &mut state.payment_codes[index];
                code.is_used = true;
                code.used_at = Some(now);
                Ok(RedeemOutcome::Charged { balance })
            }
            None => Ok(RedeemOutcome::InsufficientBalance {
                balance: state.balance_of(card_id),
            }),
        }
    }

    async fn insert_otp(&self, otp: &OtpCode) -> Result<()> {
        self.state()?.otps.push(otp.clone());
        Ok(())
    }

    async fn latest_otp(&self, phone: &str, code: &str, purpose: &str) -> Result<Option<OtpCode>> {
        Ok(self
            .state()?
            .otps
            .iter()
            .filter(|o| o.phone == phone && o.code == code && o.purpose == purpose)
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn redeem_otp(
        &self,
        otp_id: Uuid,
        card_id: Uuid,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome> {
        let mut state = self.state()?;

        let Some(index) = state
            .otps
            .iter()
            .position(|o| o.id == otp_id && !o.is_verified)
        else {
            return Ok(RedeemOutcome::AlreadyConsumed);
        };

        match state.debit(card_id, amount, now) {
            Some(balance) => {
                let otp = &mut state.otps[index];
                otp.is_verified = true;
                otp.verified_at = Some(now);
                Ok(RedeemOutcome::Charged { balance })
            }
            None => Ok(RedeemOutcome::InsufficientBalance {
                balance: state.balance_of(card_id),
            }),
        }
    }

    async fn revert_charge(
        &self,
        card_id: Uuid,
        amount: i64,
        credential: Option<ConsumedCredential>,
    ) -> Result<()> {
        let mut state = self.state()?;
        let card = state
            .cards
            .get_mut(&card_id)
            .ok_or_else(|| anyhow!("card {} does not exist", card_id))?;
        card.balance += amount;

        match credential {
            Some(ConsumedCredential::PaymentCode(id)) => {
                if let Some(code) = state.payment_codes.iter_mut().find(|c| c.id == id) {
                    code.is_used = false;
                    code.used_at = None;
                }
            }
            Some(ConsumedCredential::Otp(id)) => {
                if let Some(otp) = state.otps.iter_mut().find(|o| o.id == id) {
                    otp.is_verified = false;
                    otp.verified_at = None;
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn purge_expired_payment_codes(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.payment_codes.len();
        state
            .payment_codes
            .retain(|c| c.is_used || c.expires_at >= now);
        Ok((before - state.payment_codes.len()) as u64)
    }

    async fn purge_expired_otps(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.otps.len();
        state.otps.retain(|o| o.is_verified || o.expires_at >= now);
        Ok((before - state.otps.len()) as u64)
    }

    async fn insert_audit_entry(&self, entry: &PaymentAuditEntry) -> Result<()> {
        self.state()?.audit.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl VerificationLedger for MemoryStore {
    async fn record_attempt(&self, attempt: &VerificationAttempt) -> Result<()> {
        self.state()?.attempts.push(attempt.clone());
        Ok(())
    }

    async fn count_recent_failures(&self, card_uid: &str, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .state()?
            .attempts
            .iter()
            .filter(|a| {
                a.card_uid == card_uid
                    && !a.success
                    && a.counts_toward_lockout
                    && a.created_at > since
            })
            .count() as i64)
    }

    async fn active_lock(&self, card_uid: &str, now: DateTime<Utc>) -> Result<Option<CardLock>> {
        Ok(self
            .state()?
            .locks
            .iter()
            .filter(|l| l.card_uid == card_uid && l.locked_until > now)
            .max_by_key(|l| l.locked_until)
            .cloned())
    }

    async fn insert_lock(&self, lock: &CardLock) -> Result<()> {
        self.state()?.locks.push(lock.clone());
        Ok(())
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.locks.len();
        state.locks.retain(|l| l.locked_until > now);
        Ok((before - state.locks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escrow(retailer_id: Uuid, status: EscrowStatus, amount: i64) -> EscrowTransaction {
        let now = Utc::now();
        EscrowTransaction {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            retailer_id,
            wholesaler_id: Uuid::new_v4(),
            order_amount: amount,
            escrow_amount: amount,
            currency: "RWF".to_string(),
            status,
            auto_release_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_transition_only_from_expected_status() {
        let store = MemoryStore::new();
        let e = escrow(Uuid::new_v4(), EscrowStatus::Held, 1_000);
        store.insert_escrow(&e).await.unwrap();

        let now = Utc::now();
        let first = store
            .transition_escrow(e.id, EscrowStatus::Held, EscrowStatus::Released, now)
            .await
            .unwrap();
        let second = store
            .transition_escrow(e.id, EscrowStatus::Held, EscrowStatus::Released, now)
            .await
            .unwrap();

        assert_eq!(first.map(|e| e.status), Some(EscrowStatus::Released));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_debt_totals_ignore_held_and_refunded() {
        let store = MemoryStore::new();
        let retailer = Uuid::new_v4();
        for (status, amount) in [
            (EscrowStatus::Held, 100),
            (EscrowStatus::Released, 200),
            (EscrowStatus::Expired, 300),
            (EscrowStatus::Refunded, 400),
        ] {
            store.insert_escrow(&escrow(retailer, status, amount)).await.unwrap();
        }
        store
            .insert_escrow(&escrow(Uuid::new_v4(), EscrowStatus::Released, 999))
            .await
            .unwrap();

        let totals = store.settled_debt_totals(retailer).await.unwrap();
        assert_eq!(totals.total_debt, 500);
        assert_eq!(totals.total_repaid, 0);
    }

    #[tokio::test]
    async fn test_wallet_debit_is_conditional() {
        let store = MemoryStore::new();
        let retailer = Uuid::new_v4();
        let target = escrow(retailer, EscrowStatus::Released, 1_000);
        store.insert_escrow(&target).await.unwrap();
        store.set_wallet_balance(retailer, 500).unwrap();

        let short = wallet_repayment(&target, 600);
        assert_eq!(store.debit_wallet_for_repayment(&short).await.unwrap(), None);
        assert!(store.repayments().unwrap().is_empty());

        let ok = wallet_repayment(&target, 200);
        assert_eq!(store.debit_wallet_for_repayment(&ok).await.unwrap(), Some(300));
        assert_eq!(store.repayments().unwrap().len(), 1);

        let mut other = wallet_repayment(&target, 1);
        other.retailer_id = Uuid::new_v4();
        assert_eq!(store.debit_wallet_for_repayment(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wallet_untouched_when_repayment_rejected() {
        let store = MemoryStore::new();
        let retailer = Uuid::new_v4();
        store.set_wallet_balance(retailer, 1_000_000).unwrap();

        // 존재하지 않는 에스크로 대상 상환은 거절되고 잔액도 그대로
        let missing = escrow(retailer, EscrowStatus::Released, 100_000);
        let result = store
            .debit_wallet_for_repayment(&wallet_repayment(&missing, 50_000))
            .await;

        assert!(result.is_err());
        assert_eq!(store.wallet_balance(retailer).await.unwrap(), Some(1_000_000));
        assert!(store.repayments().unwrap().is_empty());
    }

    fn wallet_repayment(target: &EscrowTransaction, amount: i64) -> EscrowRepayment {
        EscrowRepayment {
            id: Uuid::new_v4(),
            escrow_transaction_id: target.id,
            retailer_id: target.retailer_id,
            repayment_amount: amount,
            repayment_method: RepaymentMethod::AutoDeduct,
            status: RepaymentStatus::Completed,
            reference: None,
            created_at: Utc::now(),
        }
    }
}
