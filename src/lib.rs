//! Escrow & Credit Settlement Engine
//!
//! # Overview
//!
//! 도매상-소매상 B2B 거래의 에스크로 보관/지급, 소매상 부채 상환(수동 및
//! 지갑 자동 공제), 그리고 NFC 선불 카드의 수동 결제(PIN / 일회용 코드 / OTP)를
//! 처리하는 백엔드.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         API                               │
//! │                                                           │
//! │  ┌─────────┐  ┌──────────────────────────┐  ┌─────────┐  │
//! │  │ Routes  │─▶│ Services                 │─▶│   DB    │  │
//! │  └─────────┘  │  EscrowService           │  │ (trait) │  │
//! │               │  ManualPaymentEngine     │  └────┬────┘  │
//! │  ┌─────────┐  │  SettlementScheduler ────┼──┐    │       │
//! │  │  Clock  │─▶└──────────────────────────┘  │    │       │
//! │  └─────────┘                                │    │       │
//! └─────────────────────────────────────────────┼────┼───────┘
//!                                               ▼    ▼
//!                          Ledger / SMS (HTTP)   PostgreSQL
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `clock`: 주입 가능한 시계, 영업일/스케줄 시간 계산
//! - `error`: 에러 타입 및 처리
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `services`: 비즈니스 로직 (에스크로, 결제, 스케줄러, 외부 연동)
//! - `db`: 저장소 trait과 PostgreSQL / 인메모리 구현
//! - `types`: 공통 타입 정의
//!
//! ## Usage
//!
//! ```rust,ignore
//! use escrow_settlement::{config::Config, db::Database};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let db = Database::connect(&config.database_url).await?;
//!     db.run_migrations().await?;
//!
//!     // ... 서비스 구성 후 서버 시작
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use db::Database;
pub use error::ApiError;
pub use services::{EscrowService, ManualPaymentEngine, SettlementScheduler};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn db::StoreHealth>,
    pub escrow: Arc<EscrowService>,
    pub payments: Arc<ManualPaymentEngine>,
    pub scheduler: SettlementScheduler,
    pub config: Arc<Config>,
}
