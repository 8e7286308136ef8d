//! Database Module
//!
//! PostgreSQL access through a single `PgPool`. `Database` implements every
//! repository trait; services only ever see the trait objects.
//!
//! 상태 전이와 잔액 차감은 모두 조건부 UPDATE 한 문장으로 처리한다
//! (`WHERE status = 'held'`, `WHERE balance >= $2`). 읽고-쓰기 패턴은
//! 사용하지 않는다.

mod memory;
mod models;
mod payments;
mod repository;

pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// 데이터베이스 연결 및 쿼리 담당
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 10
    /// - min_connections: 1
    /// - acquire_timeout: 3초
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreHealth for Database {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

const ESCROW_COLUMNS: &str = r#"
    id, order_id, retailer_id, wholesaler_id, order_amount, escrow_amount,
    currency, status, auto_release_at, created_at, updated_at
"#;

const SETTING_COLUMNS: &str = r#"
    retailer_id, enabled, deduction_percentage, minimum_balance_rwf,
    max_daily_deduction_rwf, created_at, updated_at
"#;

#[async_trait]
impl EscrowRepository for Database {
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_transactions (
                id, order_id, retailer_id, wholesaler_id, order_amount, escrow_amount,
                currency, status, auto_release_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(escrow.id)
        .bind(escrow.order_id)
        .bind(escrow.retailer_id)
        .bind(escrow.wholesaler_id)
        .bind(escrow.order_amount)
        .bind(escrow.escrow_amount)
        .bind(&escrow.currency)
        .bind(escrow.status)
        .bind(escrow.auto_release_at)
        .bind(escrow.created_at)
        .bind(escrow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrow_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn find_held_escrows_past_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>> {
        let escrows = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            SELECT {ESCROW_COLUMNS}
            FROM escrow_transactions
            WHERE status = 'held' AND auto_release_at <= $1
            ORDER BY auto_release_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(escrows)
    }

    async fn transition_escrow(
        &self,
        id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowTransaction>> {
        // 조건부 UPDATE: 이미 전이된 행은 매칭되지 않음
        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            UPDATE escrow_transactions
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING {ESCROW_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn settled_debt_totals(&self, retailer_id: Uuid) -> Result<DebtTotals> {
        let totals = sqlx::query_as::<_, DebtTotals>(
            r#"
            SELECT
                (SELECT COALESCE(SUM(escrow_amount), 0)::BIGINT
                   FROM escrow_transactions
                  WHERE retailer_id = $1 AND status IN ('released', 'expired')) AS total_debt,
                (SELECT COALESCE(SUM(repayment_amount), 0)::BIGINT
                   FROM escrow_repayments
                  WHERE retailer_id = $1 AND status = 'completed') AS total_repaid
            "#,
        )
        .bind(retailer_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }

    async fn sum_repayments_since(
        &self,
        retailer_id: Uuid,
        method: RepaymentMethod,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(repayment_amount), 0)::BIGINT
            FROM escrow_repayments
            WHERE retailer_id = $1
              AND repayment_method = $2
              AND status = 'completed'
              AND created_at >= $3
            "#,
        )
        .bind(retailer_id)
        .bind(method)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(total.0)
    }

    async fn oldest_settled_escrow(&self, retailer_id: Uuid) -> Result<Option<EscrowTransaction>> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            SELECT {ESCROW_COLUMNS}
            FROM escrow_transactions
            WHERE retailer_id = $1 AND status IN ('released', 'expired')
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(retailer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn insert_repayment(&self, repayment: &EscrowRepayment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_repayments (
                id, escrow_transaction_id, retailer_id, repayment_amount,
                repayment_method, status, reference, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(repayment.id)
        .bind(repayment.escrow_transaction_id)
        .bind(repayment.retailer_id)
        .bind(repayment.repayment_amount)
        .bind(repayment.repayment_method)
        .bind(repayment.status)
        .bind(&repayment.reference)
        .bind(repayment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn enabled_auto_deductions(&self) -> Result<Vec<AutoDeductionSetting>> {
        let settings = sqlx::query_as::<_, AutoDeductionSetting>(&format!(
            "SELECT {SETTING_COLUMNS} FROM auto_deduction_settings WHERE enabled = TRUE ORDER BY retailer_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(settings)
    }

    async fn find_auto_deduction(&self, retailer_id: Uuid) -> Result<Option<AutoDeductionSetting>> {
        let setting = sqlx::query_as::<_, AutoDeductionSetting>(&format!(
            "SELECT {SETTING_COLUMNS} FROM auto_deduction_settings WHERE retailer_id = $1"
        ))
        .bind(retailer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(setting)
    }

    async fn upsert_auto_deduction(
        &self,
        setting: &AutoDeductionSetting,
    ) -> Result<AutoDeductionSetting> {
        let saved = sqlx::query_as::<_, AutoDeductionSetting>(&format!(
            r#"
            INSERT INTO auto_deduction_settings (
                retailer_id, enabled, deduction_percentage, minimum_balance_rwf,
                max_daily_deduction_rwf, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (retailer_id)
            DO UPDATE SET
                enabled = EXCLUDED.enabled,
                deduction_percentage = EXCLUDED.deduction_percentage,
                minimum_balance_rwf = EXCLUDED.minimum_balance_rwf,
                max_daily_deduction_rwf = EXCLUDED.max_daily_deduction_rwf,
                updated_at = EXCLUDED.updated_at
            RETURNING {SETTING_COLUMNS}
            "#
        ))
        .bind(setting.retailer_id)
        .bind(setting.enabled)
        .bind(setting.deduction_percentage)
        .bind(setting.minimum_balance_rwf)
        .bind(setting.max_daily_deduction_rwf)
        .bind(setting.created_at)
        .bind(setting.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(saved)
    }
}

#[async_trait]
impl RetailerWallet for Database {
    async fn wallet_balance(&self, retailer_id: Uuid) -> Result<Option<i64>> {
        let balance: Option<(i64,)> =
            sqlx::query_as("SELECT balance FROM retailer_wallets WHERE retailer_id = $1")
                .bind(retailer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(balance.map(|b| b.0))
    }

    async fn debit_wallet_for_repayment(
        &self,
        repayment: &EscrowRepayment,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let balance: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE retailer_wallets
            SET balance = balance - $2, updated_at = $3
            WHERE retailer_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(repayment.retailer_id)
        .bind(repayment.repayment_amount)
        .bind(repayment.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((balance,)) = balance else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            INSERT INTO escrow_repayments (
                id, escrow_transaction_id, retailer_id, repayment_amount,
                repayment_method, status, reference, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(repayment.id)
        .bind(repayment.escrow_transaction_id)
        .bind(repayment.retailer_id)
        .bind(repayment.repayment_amount)
        .bind(repayment.repayment_method)
        .bind(repayment.status)
        .bind(&repayment.reference)
        .bind(repayment.created_at)
        .execute(&mut *tx)
        .await?;

        // 커밋 전 실패하면 tx drop 시 롤백
        tx.commit().await?;
        Ok(Some(balance))
    }
}
