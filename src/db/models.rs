//! Database Models
//!
//! Escrow ledger rows (escrow transactions, repayments, auto-deduction
//! settings, retailer wallets) and the manual card payment rows (cards,
//! one-time codes, OTPs, verification attempts, locks, audit entries).
//!
//! 금액은 모두 RWF 정수 (i64). RWF는 보조 단위가 없음.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ============ Escrow ============

/// 에스크로 상태
///
/// `held`에서만 전이 가능하며 나머지는 모두 종결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "escrow_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Held,
    Released,
    Expired,
    Refunded,
}

impl EscrowStatus {
    /// Released and expired escrows are owed back by the retailer.
    pub fn is_settled(self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Expired => "expired",
            EscrowStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 주문 하나에 대해 보관 중인 자금
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EscrowTransaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub retailer_id: Uuid,
    pub wholesaler_id: Uuid,
    pub order_amount: i64,
    /// 항상 `order_amount` 이하
    pub escrow_amount: i64,
    pub currency: String,
    pub status: EscrowStatus,
    /// 이 시각이 지나면 자동 지급 대상
    pub auto_release_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "repayment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RepaymentMethod {
    Manual,
    AutoDeduct,
    MobileMoney,
    Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "repayment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RepaymentStatus {
    Pending,
    Completed,
    Failed,
}

/// 소매상 상환 기록 (에스크로 하나에 여러 건 가능)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EscrowRepayment {
    pub id: Uuid,
    pub escrow_transaction_id: Uuid,
    pub retailer_id: Uuid,
    pub repayment_amount: i64,
    pub repayment_method: RepaymentMethod,
    pub status: RepaymentStatus,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Sums feeding the outstanding-debt computation, read in one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct DebtTotals {
    pub total_debt: i64,
    pub total_repaid: i64,
}

/// 소매상별 자동 공제 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AutoDeductionSetting {
    pub retailer_id: Uuid,
    pub enabled: bool,
    /// 0 ~ 100 (%)
    pub deduction_percentage: Decimal,
    /// 지갑 잔액이 이 값 이하이면 공제하지 않음
    pub minimum_balance_rwf: i64,
    /// 영업일 하루 공제 한도
    pub max_daily_deduction_rwf: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutoDeductionSetting {
    /// Amount to pull from the wallet in this run.
    ///
    /// `min(outstanding * pct / 100, daily cap left, balance above the floor)`,
    /// never more than `outstanding` and never negative.
    pub fn deduction_for(&self, outstanding: i64, deducted_today: i64, wallet_balance: i64) -> i64 {
        if outstanding <= 0 {
            return 0;
        }

        let by_percentage = (Decimal::from(outstanding) * self.deduction_percentage
            / Decimal::ONE_HUNDRED)
            .floor()
            .to_i64()
            .unwrap_or(0);
        let daily_room = (self.max_daily_deduction_rwf - deducted_today).max(0);
        let balance_room = (wallet_balance - self.minimum_balance_rwf).max(0);

        by_percentage
            .min(daily_room)
            .min(balance_room)
            .min(outstanding)
            .max(0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.deduction_percentage < Decimal::ZERO
            || self.deduction_percentage > Decimal::ONE_HUNDRED
        {
            return Err("deduction_percentage must be between 0 and 100".to_string());
        }
        if self.minimum_balance_rwf < 0 {
            return Err("minimum_balance_rwf must not be negative".to_string());
        }
        if self.max_daily_deduction_rwf < 0 {
            return Err("max_daily_deduction_rwf must not be negative".to_string());
        }
        Ok(())
    }
}

// ============ Manual card payments ============

/// 선불 NFC 카드
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct NfcCard {
    pub id: Uuid,
    /// 카드 외부 식별자 (NFC UID)
    pub card_uid: String,
    pub balance: i64,
    /// Argon2 PHC 문자열
    pub pin_hash: String,
    pub is_active: bool,
    pub customer_id: Option<Uuid>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Pin,
    Code,
    Otp,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Pin => "pin",
            PaymentMethod::Code => "code",
            PaymentMethod::Otp => "otp",
        }
    }
}

/// 8자리 일회용 결제 코드
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PaymentCode {
    pub id: Uuid,
    pub card_id: Uuid,
    pub code: String,
    /// 검증 시 호출자가 아닌 이 값으로 결제
    pub amount: i64,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
    pub customer_phone: String,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// OTP 발급 시 함께 저장되는 결제 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpMetadata {
    pub card_uid: String,
    pub card_id: Uuid,
    pub amount: i64,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
}

/// 6자리 결제 승인 OTP
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OtpCode {
    pub id: Uuid,
    pub phone: String,
    pub code: String,
    pub purpose: String,
    pub expires_at: DateTime<Utc>,
    pub is_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub metadata: Json<OtpMetadata>,
    pub created_at: DateTime<Utc>,
}

/// 검증 시도 기록 (append-only)
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct VerificationAttempt {
    pub id: Uuid,
    pub card_uid: String,
    pub retailer_id: Uuid,
    pub method: PaymentMethod,
    pub success: bool,
    /// 잠금 판정 윈도우에 포함되는 실패인지
    pub counts_toward_lockout: bool,
    pub failure_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 카드 잠금
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CardLock {
    pub id: Uuid,
    pub card_uid: String,
    pub locked_at: DateTime<Utc>,
    pub locked_until: DateTime<Utc>,
    pub reason: String,
}

/// 결제 감사 로그. 세 가지 검증 방식 모두 같은 형태
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PaymentAuditEntry {
    pub id: Uuid,
    pub card_uid: String,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
    pub amount: Option<i64>,
    pub method: PaymentMethod,
    /// 마지막 4자리만 남긴 자격 증명
    pub masked_code: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub transaction_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Result of the atomic "consume credential + debit card" unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    Charged { balance: i64 },
    AlreadyConsumed,
    InsufficientBalance { balance: i64 },
}

/// 원장 기록에 실패해 되돌려야 하는 소비된 자격 증명
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumedCredential {
    PaymentCode(Uuid),
    Otp(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn setting(pct: Decimal, min_balance: i64, max_daily: i64) -> AutoDeductionSetting {
        AutoDeductionSetting {
            retailer_id: Uuid::new_v4(),
            enabled: true,
            deduction_percentage: pct,
            minimum_balance_rwf: min_balance,
            max_daily_deduction_rwf: max_daily,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_deduction_capped_by_daily_max() {
        let s = setting(dec!(30), 0, 200_000);
        assert_eq!(s.deduction_for(1_000_000, 0, 5_000_000), 200_000);
    }

    #[test]
    fn test_deduction_uses_percentage_under_cap() {
        let s = setting(dec!(10), 0, 200_000);
        assert_eq!(s.deduction_for(1_000_000, 0, 5_000_000), 100_000);
    }

    #[test]
    fn test_deduction_keeps_minimum_balance() {
        let s = setting(dec!(50), 40_000, 1_000_000);
        // 잔액 100,000 중 최소 40,000은 남겨야 함
        assert_eq!(s.deduction_for(500_000, 0, 100_000), 60_000);
    }

    #[test]
    fn test_deduction_counts_earlier_deductions_today() {
        let s = setting(dec!(30), 0, 200_000);
        assert_eq!(s.deduction_for(1_000_000, 150_000, 5_000_000), 50_000);
        assert_eq!(s.deduction_for(1_000_000, 200_000, 5_000_000), 0);
    }

    #[test]
    fn test_fractional_percentage_rounds_down() {
        let s = setting(dec!(12.5), 0, 1_000_000);
        assert_eq!(s.deduction_for(1_001, 0, 1_000_000), 125);
    }

    #[test]
    fn test_validate_rejects_out_of_range_percentage() {
        assert!(setting(dec!(100.5), 0, 1).validate().is_err());
        assert!(setting(dec!(-1), 0, 1).validate().is_err());
        assert!(setting(dec!(100), 0, 1).validate().is_ok());
    }

    #[test]
    fn test_settled_statuses() {
        assert!(EscrowStatus::Released.is_settled());
        assert!(EscrowStatus::Expired.is_settled());
        assert!(!EscrowStatus::Held.is_settled());
        assert!(!EscrowStatus::Refunded.is_settled());
    }
}
