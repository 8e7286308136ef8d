//! Services Module
//!
//! 비즈니스 로직을 담당하는 서비스 레이어
//!
//! # Services
//! - `EscrowService`: 에스크로 보관/지급, 부채 계산, 자동 공제
//! - `ManualPaymentEngine`: PIN / 일회용 코드 / OTP 카드 결제
//! - `SettlementScheduler`: 자동 지급, 자동 공제, 만료 정리 작업
//! - `TransactionRecorder`, `SmsSender`: 외부 원장 / SMS 게이트웨이

pub mod escrow;
pub mod ledger;
pub mod payments;
pub mod scheduler;
pub mod security;
pub mod sms;
pub mod verification;

pub use escrow::{
    AutoDeductReport, AutoDeductionUpdate, AutoReleaseReport, DebtSummary, EscrowService,
    EscrowSettings, NewEscrow, SettlementFailure,
};
pub use ledger::{HttpLedgerClient, LedgerEntry, RecordedTransaction, TracingLedger, TransactionRecorder};
pub use payments::{ChargeContext, ChargeReceipt, CleanupReport, IssuedCredential, ManualPaymentEngine};
pub use scheduler::{JobKind, JobStatus, NextRunTimes, ScheduleSettings, SettlementScheduler};
pub use security::hash_pin;
pub use sms::{AlertDispatcher, HttpSmsGateway, SmsSender, TracingSms};
pub use verification::RateLimiter;
