//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/api/scheduler/*` - 스케줄러 상태 / 수동 실행
//! - `/api/escrow/*` - 에스크로 보관, 지급, 부채, 자동 공제 설정
//! - `/api/payments/*` - PIN / 일회용 코드 / OTP 카드 결제

pub mod escrow;
pub mod health;
pub mod payments;
pub mod scheduler;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

/// 라우터 생성 (미들웨어는 `main`에서 추가)
///
/// ```text
/// GET  /health
///
/// GET  /api/scheduler/status
/// POST /api/scheduler/trigger-auto-release
/// POST /api/scheduler/trigger-auto-deduct
/// GET  /api/scheduler/next-run-times
///
/// POST /api/escrow
/// POST /api/escrow/:id/release
/// POST /api/escrow/:id/refund
/// POST /api/escrow/:id/expire
/// POST /api/escrow/:id/repayments
/// GET  /api/escrow/debt/:retailer_id
/// GET  /api/escrow/auto-deduction/:retailer_id
/// PUT  /api/escrow/auto-deduction/:retailer_id
///
/// POST /api/payments/pin
/// POST /api/payments/code
/// POST /api/payments/code/verify
/// POST /api/payments/otp
/// POST /api/payments/otp/verify
/// ```
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))

        // Scheduler
        .route("/api/scheduler/status", get(scheduler::get_status))
        .route("/api/scheduler/trigger-auto-release", post(scheduler::trigger_auto_release))
        .route("/api/scheduler/trigger-auto-deduct", post(scheduler::trigger_auto_deduct))
        .route("/api/scheduler/next-run-times", get(scheduler::get_next_run_times))

        // Escrow
        .route("/api/escrow", post(escrow::hold_funds))
        .route("/api/escrow/:id/release", post(escrow::release_escrow))
        .route("/api/escrow/:id/refund", post(escrow::refund_escrow))
        .route("/api/escrow/:id/expire", post(escrow::expire_escrow))
        .route("/api/escrow/:id/repayments", post(escrow::record_repayment))
        .route("/api/escrow/debt/:retailer_id", get(escrow::get_debt))
        .route(
            "/api/escrow/auto-deduction/:retailer_id",
            get(escrow::get_auto_deduction).put(escrow::put_auto_deduction),
        )

        // Manual card payments
        .route("/api/payments/pin", post(payments::pay_with_pin))
        .route("/api/payments/code", post(payments::generate_code))
        .route("/api/payments/code/verify", post(payments::verify_code))
        .route("/api/payments/otp", post(payments::request_otp))
        .route("/api/payments/otp/verify", post(payments::verify_otp))

        .with_state(state)
}
