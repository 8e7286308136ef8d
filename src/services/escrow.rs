//! Escrow Lifecycle Service
//!
//! ```text
//! held ──release / auto-release──▶ released ┐
//!   │ ──────────expire────────────▶ expired  ├─ retailer debt
//!   └───────────refund────────────▶ refunded  (no debt)
//! ```
//!
//! Every transition is a compare-and-swap on `status = held`, so two callers
//! racing on the same escrow see exactly one winner. Batch jobs isolate
//! failures per row and report them instead of aborting.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{start_of_business_day, Clock};
use crate::db::{
    AutoDeductionSetting, EscrowRepayment, EscrowRepository, EscrowStatus, EscrowTransaction,
    RepaymentMethod, RepaymentStatus, RetailerWallet,
};
use crate::error::EscrowError;
use crate::services::ledger::{LedgerEntry, TransactionRecorder};
use crate::types::format_amount;

/// 서비스 설정 (Config에서 파생)
#[derive(Debug, Clone)]
pub struct EscrowSettings {
    pub currency: String,
    pub auto_release_days: i64,
    pub business_offset: FixedOffset,
}

/// 주문 생성 시 보관 요청
#[derive(Debug, Clone, Deserialize)]
pub struct NewEscrow {
    pub order_id: Uuid,
    pub retailer_id: Uuid,
    pub wholesaler_id: Uuid,
    pub order_amount: i64,
    pub escrow_amount: i64,
    /// 없으면 `now + auto_release_days`
    #[serde(default)]
    pub auto_release_at: Option<DateTime<Utc>>,
}

/// 자동 공제 설정 변경 요청
#[derive(Debug, Clone, Deserialize)]
pub struct AutoDeductionUpdate {
    pub enabled: bool,
    pub deduction_percentage: Decimal,
    pub minimum_balance_rwf: i64,
    pub max_daily_deduction_rwf: i64,
}

/// One row that could not be fully processed in a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementFailure {
    /// escrow id (auto-release) or retailer id (auto-deduct)
    pub subject_id: Uuid,
    pub stage: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoReleaseReport {
    pub released: usize,
    pub failures: Vec<SettlementFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoDeductReport {
    pub processed: usize,
    pub total_amount: i64,
    pub skipped: usize,
    pub failures: Vec<SettlementFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DebtSummary {
    pub retailer_id: Uuid,
    pub total_debt: i64,
    pub total_repaid: i64,
    pub outstanding: i64,
}

/// Outcome of one retailer inside an auto-deduct run.
enum Deduction {
    Applied(i64),
    Skipped(&'static str),
}

pub struct EscrowService {
    repo: Arc<dyn EscrowRepository>,
    wallet: Arc<dyn RetailerWallet>,
    ledger: Arc<dyn TransactionRecorder>,
    clock: Arc<dyn Clock>,
    settings: EscrowSettings,
}

impl EscrowService {
    pub fn new(
        repo: Arc<dyn EscrowRepository>,
        wallet: Arc<dyn RetailerWallet>,
        ledger: Arc<dyn TransactionRecorder>,
        clock: Arc<dyn Clock>,
        settings: EscrowSettings,
    ) -> Self {
        Self {
            repo,
            wallet,
            ledger,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &EscrowSettings {
        &self.settings
    }

    // ============ Lifecycle ============

    pub async fn hold_funds(&self, new: NewEscrow) -> Result<EscrowTransaction, EscrowError> {
        if new.escrow_amount <= 0 {
            return Err(EscrowError::InvalidAmount(
                "escrow_amount must be positive".to_string(),
            ));
        }
        if new.escrow_amount > new.order_amount {
            return Err(EscrowError::InvalidAmount(format!(
                "escrow_amount {} exceeds order_amount {}",
                new.escrow_amount, new.order_amount
            )));
        }

        let now = self.clock.now();
        let escrow = EscrowTransaction {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            retailer_id: new.retailer_id,
            wholesaler_id: new.wholesaler_id,
            order_amount: new.order_amount,
            escrow_amount: new.escrow_amount,
            currency: self.settings.currency.clone(),
            status: EscrowStatus::Held,
            auto_release_at: new
                .auto_release_at
                .unwrap_or(now + Duration::days(self.settings.auto_release_days)),
            created_at: now,
            updated_at: now,
        };
        self.repo.insert_escrow(&escrow).await?;

        tracing::info!(
            escrow_id = %escrow.id,
            order_id = %escrow.order_id,
            retailer_id = %escrow.retailer_id,
            amount = %format_amount(escrow.escrow_amount, &escrow.currency),
            auto_release_at = %escrow.auto_release_at,
            "Funds held in escrow"
        );
        Ok(escrow)
    }

    /// Releases a held escrow to the wholesaler.
    ///
    /// The payout is attempted after the status change and its failure is
    /// logged; the release itself stands.
    pub async fn release_escrow(&self, id: Uuid) -> Result<EscrowTransaction, EscrowError> {
        let escrow = self.transition(id, EscrowStatus::Released).await?;
        if let Err(e) = self.pay_wholesaler(&escrow).await {
            tracing::error!(escrow_id = %id, "Wholesaler payout failed after release: {:#}", e);
        }
        Ok(escrow)
    }

    pub async fn expire_escrow(&self, id: Uuid) -> Result<EscrowTransaction, EscrowError> {
        self.transition(id, EscrowStatus::Expired).await
    }

    pub async fn refund_escrow(&self, id: Uuid) -> Result<EscrowTransaction, EscrowError> {
        self.transition(id, EscrowStatus::Refunded).await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: EscrowStatus,
    ) -> Result<EscrowTransaction, EscrowError> {
        let escrow = self
            .repo
            .transition_escrow(id, EscrowStatus::Held, to, self.clock.now())
            .await?
            .ok_or(EscrowError::NotFoundOrAlreadyReleased(id))?;

        tracing::info!(escrow_id = %id, status = %to, "Escrow transitioned");
        Ok(escrow)
    }

    async fn pay_wholesaler(&self, escrow: &EscrowTransaction) -> anyhow::Result<String> {
        let recorded = self
            .ledger
            .record_transaction(&LedgerEntry {
                reference: format!("ESCROW-RELEASE-{}", escrow.id),
                amount: escrow.escrow_amount,
                source: format!("escrow:{}", escrow.id),
                destination: format!("wholesaler:{}", escrow.wholesaler_id),
                currency: escrow.currency.clone(),
                description: format!("Escrow release for order {}", escrow.order_id),
                metadata: serde_json::json!({
                    "escrow_id": escrow.id,
                    "order_id": escrow.order_id,
                    "retailer_id": escrow.retailer_id,
                }),
            })
            .await?;
        Ok(recorded.transaction_id)
    }

    async fn post_deduction(&self, repayment: &EscrowRepayment, reference: &str) -> anyhow::Result<String> {
        let recorded = self
            .ledger
            .record_transaction(&LedgerEntry {
                reference: reference.to_string(),
                amount: repayment.repayment_amount,
                source: format!("retailer_wallet:{}", repayment.retailer_id),
                destination: format!("escrow:{}", repayment.escrow_transaction_id),
                currency: self.settings.currency.clone(),
                description: "Automatic debt deduction".to_string(),
                metadata: serde_json::json!({
                    "repayment_id": repayment.id,
                    "retailer_id": repayment.retailer_id,
                    "escrow_id": repayment.escrow_transaction_id,
                }),
            })
            .await?;
        Ok(recorded.transaction_id)
    }

    /// Releases every held escrow whose deadline has passed.
    ///
    /// Rows another caller released first are skipped. Payout failures are
    /// reported per row and never undo the release.
    pub async fn process_auto_releases(&self) -> anyhow::Result<AutoReleaseReport> {
        let now = self.clock.now();
        let due = self.repo.find_held_escrows_past_deadline(now).await?;
        let mut report = AutoReleaseReport::default();

        tracing::info!(candidates = due.len(), "Auto-release run started");

        for candidate in due {
            let escrow = match self
                .repo
                .transition_escrow(candidate.id, EscrowStatus::Held, EscrowStatus::Released, now)
                .await
            {
                Ok(Some(escrow)) => escrow,
                Ok(None) => {
                    tracing::debug!(escrow_id = %candidate.id, "Escrow already settled, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::error!(escrow_id = %candidate.id, "Auto-release failed: {:#}", e);
                    report.failures.push(SettlementFailure {
                        subject_id: candidate.id,
                        stage: "release",
                        reason: format!("{:#}", e),
                    });
                    continue;
                }
            };
            report.released += 1;

            match self.pay_wholesaler(&escrow).await {
                Ok(transaction_id) => tracing::info!(
                    escrow_id = %escrow.id,
                    wholesaler_id = %escrow.wholesaler_id,
                    %transaction_id,
                    "Escrow auto-released"
                ),
                Err(e) => {
                    tracing::error!(
                        escrow_id = %escrow.id,
                        wholesaler_id = %escrow.wholesaler_id,
                        "Payout failed for auto-released escrow: {:#}",
                        e
                    );
                    report.failures.push(SettlementFailure {
                        subject_id: escrow.id,
                        stage: "payout",
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        tracing::info!(
            released = report.released,
            failures = report.failures.len(),
            "Auto-release run finished"
        );
        Ok(report)
    }

    // ============ Debt ============

    pub async fn compute_outstanding_debt(
        &self,
        retailer_id: Uuid,
    ) -> Result<DebtSummary, EscrowError> {
        let totals = self.repo.settled_debt_totals(retailer_id).await?;
        Ok(DebtSummary {
            retailer_id,
            total_debt: totals.total_debt,
            total_repaid: totals.total_repaid,
            outstanding: (totals.total_debt - totals.total_repaid).max(0),
        })
    }

    pub async fn record_repayment(
        &self,
        escrow_id: Uuid,
        retailer_id: Uuid,
        amount: i64,
        method: RepaymentMethod,
        reference: Option<String>,
    ) -> Result<EscrowRepayment, EscrowError> {
        // auto_deduct 합계가 일일 한도 계산에 쓰이므로 수동 기록 불가
        if method == RepaymentMethod::AutoDeduct {
            return Err(EscrowError::ReservedMethod);
        }
        if amount <= 0 {
            return Err(EscrowError::InvalidAmount(
                "repayment amount must be positive".to_string(),
            ));
        }

        let escrow = self
            .repo
            .find_escrow(escrow_id)
            .await?
            .ok_or(EscrowError::NotFound(escrow_id))?;
        if escrow.retailer_id != retailer_id {
            return Err(EscrowError::RetailerMismatch);
        }
        if !escrow.status.is_settled() {
            return Err(EscrowError::NotRepayable {
                escrow_id,
                status: escrow.status,
            });
        }

        let debt = self.compute_outstanding_debt(retailer_id).await?;
        if amount > debt.outstanding {
            return Err(EscrowError::RepaymentExceedsDebt {
                outstanding: debt.outstanding,
            });
        }

        let repayment = EscrowRepayment {
            id: Uuid::new_v4(),
            escrow_transaction_id: escrow_id,
            retailer_id,
            repayment_amount: amount,
            repayment_method: method,
            status: RepaymentStatus::Completed,
            reference,
            created_at: self.clock.now(),
        };
        self.repo.insert_repayment(&repayment).await?;

        tracing::info!(
            %escrow_id,
            %retailer_id,
            amount,
            remaining = debt.outstanding - amount,
            "Repayment recorded"
        );
        Ok(repayment)
    }

    // ============ Auto-deduction ============

    pub async fn auto_deduction(
        &self,
        retailer_id: Uuid,
    ) -> Result<Option<AutoDeductionSetting>, EscrowError> {
        Ok(self.repo.find_auto_deduction(retailer_id).await?)
    }

    pub async fn upsert_auto_deduction(
        &self,
        retailer_id: Uuid,
        update: AutoDeductionUpdate,
    ) -> Result<AutoDeductionSetting, EscrowError> {
        let now = self.clock.now();
        let setting = AutoDeductionSetting {
            retailer_id,
            enabled: update.enabled,
            deduction_percentage: update.deduction_percentage,
            minimum_balance_rwf: update.minimum_balance_rwf,
            max_daily_deduction_rwf: update.max_daily_deduction_rwf,
            created_at: now,
            updated_at: now,
        };
        setting.validate().map_err(EscrowError::InvalidSetting)?;

        let saved = self.repo.upsert_auto_deduction(&setting).await?;
        tracing::info!(
            %retailer_id,
            enabled = saved.enabled,
            percentage = %saved.deduction_percentage,
            "Auto-deduction setting saved"
        );
        Ok(saved)
    }

    /// Pulls a share of each opted-in retailer's wallet toward their debt.
    pub async fn process_auto_deductions(&self) -> anyhow::Result<AutoDeductReport> {
        let settings = self.repo.enabled_auto_deductions().await?;
        let mut report = AutoDeductReport::default();

        tracing::info!(retailers = settings.len(), "Auto-deduct run started");

        for setting in settings {
            match self.deduct_for(&setting).await {
                Ok(Deduction::Applied(amount)) => {
                    report.processed += 1;
                    report.total_amount += amount;
                }
                Ok(Deduction::Skipped(reason)) => {
                    tracing::debug!(retailer_id = %setting.retailer_id, reason, "Auto-deduct skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(
                        retailer_id = %setting.retailer_id,
                        "Auto-deduct failed: {:#}",
                        e
                    );
                    report.failures.push(SettlementFailure {
                        subject_id: setting.retailer_id,
                        stage: "deduct",
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            total = %format_amount(report.total_amount, &self.settings.currency),
            "Auto-deduct run finished"
        );
        Ok(report)
    }

    async fn deduct_for(&self, setting: &AutoDeductionSetting) -> anyhow::Result<Deduction> {
        let retailer_id = setting.retailer_id;
        let debt = self.compute_outstanding_debt(retailer_id).await?;
        if debt.outstanding <= 0 {
            return Ok(Deduction::Skipped("no outstanding debt"));
        }

        let Some(balance) = self.wallet.wallet_balance(retailer_id).await? else {
            return Ok(Deduction::Skipped("no wallet"));
        };
        if balance <= setting.minimum_balance_rwf {
            return Ok(Deduction::Skipped("balance at or below minimum"));
        }

        let now = self.clock.now();
        let day_start = start_of_business_day(now, self.settings.business_offset);
        let deducted_today = self
            .repo
            .sum_repayments_since(retailer_id, RepaymentMethod::AutoDeduct, day_start)
            .await?;

        let amount = setting.deduction_for(debt.outstanding, deducted_today, balance);
        if amount <= 0 {
            return Ok(Deduction::Skipped("daily limit reached"));
        }

        let Some(target) = self.repo.oldest_settled_escrow(retailer_id).await? else {
            return Ok(Deduction::Skipped("no settled escrow"));
        };

        let reference = format!(
            "AUTO-DEDUCT-{}-{}",
            now.with_timezone(&self.settings.business_offset).format("%Y%m%d"),
            Uuid::new_v4().simple()
        );
        let repayment = EscrowRepayment {
            id: Uuid::new_v4(),
            escrow_transaction_id: target.id,
            retailer_id,
            repayment_amount: amount,
            repayment_method: RepaymentMethod::AutoDeduct,
            status: RepaymentStatus::Completed,
            reference: Some(reference.clone()),
            created_at: now,
        };
        if self.wallet.debit_wallet_for_repayment(&repayment).await?.is_none() {
            return Ok(Deduction::Skipped("wallet balance changed"));
        }

        // 지갑 차감과 상환 기록은 이미 커밋됨. 원장 기록 실패는 경고만.
        if let Err(e) = self.post_deduction(&repayment, &reference).await {
            tracing::warn!(
                %retailer_id,
                %reference,
                amount,
                "Auto-deduction applied but ledger posting failed: {:#}",
                e
            );
        }

        tracing::info!(
            %retailer_id,
            escrow_id = %target.id,
            amount = %format_amount(amount, &self.settings.currency),
            remaining = debt.outstanding - amount,
            "Auto-deduction applied"
        );
        Ok(Deduction::Applied(amount))
    }
}
