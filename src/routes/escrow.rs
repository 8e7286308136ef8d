//! Escrow Endpoints
//!
//! 주문 시스템이 자금 보관을 요청하고, 관리자가 지급/환불하며,
//! 소매상 부채와 자동 공제 설정을 조회/변경하는 엔드포인트.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{AutoDeductionSetting, EscrowRepayment, EscrowTransaction, RepaymentMethod};
use crate::error::ApiError;
use crate::services::{AutoDeductionUpdate, DebtSummary, NewEscrow};
use crate::AppState;

// ============ Request Types ============

/// 상환 기록 요청
#[derive(Debug, Deserialize)]
pub struct RepaymentRequest {
    pub retailer_id: Uuid,
    pub amount: i64,
    /// 기본값: manual
    #[serde(default = "default_method")]
    pub method: RepaymentMethod,
    pub reference: Option<String>,
}

fn default_method() -> RepaymentMethod {
    RepaymentMethod::Manual
}

// ============ Handlers ============

/// POST /api/escrow
///
/// ```json
/// {
///   "order_id": "…", "retailer_id": "…", "wholesaler_id": "…",
///   "order_amount": 500000, "escrow_amount": 500000
/// }
/// ```
pub async fn hold_funds(
    State(state): State<AppState>,
    Json(req): Json<NewEscrow>,
) -> Result<(StatusCode, Json<EscrowTransaction>), ApiError> {
    let escrow = state.escrow.hold_funds(req).await?;
    Ok((StatusCode::CREATED, Json(escrow)))
}

/// POST /api/escrow/:id/release
///
/// 이미 지급/만료/환불된 경우 409
pub async fn release_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowTransaction>, ApiError> {
    Ok(Json(state.escrow.release_escrow(id).await?))
}

/// POST /api/escrow/:id/refund
pub async fn refund_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowTransaction>, ApiError> {
    Ok(Json(state.escrow.refund_escrow(id).await?))
}

/// POST /api/escrow/:id/expire
pub async fn expire_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowTransaction>, ApiError> {
    Ok(Json(state.escrow.expire_escrow(id).await?))
}

/// GET /api/escrow/debt/:retailer_id
pub async fn get_debt(
    State(state): State<AppState>,
    Path(retailer_id): Path<Uuid>,
) -> Result<Json<DebtSummary>, ApiError> {
    Ok(Json(state.escrow.compute_outstanding_debt(retailer_id).await?))
}

/// POST /api/escrow/:id/repayments
pub async fn record_repayment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RepaymentRequest>,
) -> Result<(StatusCode, Json<EscrowRepayment>), ApiError> {
    let repayment = state
        .escrow
        .record_repayment(id, req.retailer_id, req.amount, req.method, req.reference)
        .await?;
    Ok((StatusCode::CREATED, Json(repayment)))
}

/// GET /api/escrow/auto-deduction/:retailer_id
pub async fn get_auto_deduction(
    State(state): State<AppState>,
    Path(retailer_id): Path<Uuid>,
) -> Result<Json<AutoDeductionSetting>, ApiError> {
    state
        .escrow
        .auto_deduction(retailer_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Auto-deduction setting for {}", retailer_id)))
}

/// PUT /api/escrow/auto-deduction/:retailer_id
pub async fn put_auto_deduction(
    State(state): State<AppState>,
    Path(retailer_id): Path<Uuid>,
    Json(req): Json<AutoDeductionUpdate>,
) -> Result<Json<AutoDeductionSetting>, ApiError> {
    Ok(Json(state.escrow.upsert_auto_deduction(retailer_id, req).await?))
}
