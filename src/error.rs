//! Error Handling Module
//!
//! Three layers:
//!
//! - `VerificationError`: expected, user-facing card payment declines. These
//!   are returned as values (`Ok(Err(..))`) and rendered as structured
//!   `{success: false, ...}` bodies, never raised.
//! - `EscrowError`: escrow lifecycle rule violations plus storage failures.
//! - `ApiError`: HTTP mapping for everything that reaches a handler.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::EscrowStatus;

/// 카드 결제 검증 실패 사유
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Card not found")]
    CardNotFound,

    #[error("Card is inactive")]
    CardInactive,

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Invalid code")]
    InvalidCode,

    #[error("Code has expired")]
    Expired,

    #[error("Code has already been used")]
    AlreadyUsed,

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Insufficient balance: {balance} available")]
    InsufficientBalance { balance: i64 },

    #[error("Card is locked until {until}")]
    CardLocked { until: DateTime<Utc> },

    #[error("Too many failed attempts, card locked until {until}")]
    TooManyAttempts { until: DateTime<Utc> },

    #[error("Code was issued for a different retailer")]
    RetailerMismatch,
}

impl VerificationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            VerificationError::CardNotFound => "card_not_found",
            VerificationError::CardInactive => "card_inactive",
            VerificationError::InvalidPin => "invalid_pin",
            VerificationError::InvalidCode => "invalid_code",
            VerificationError::Expired => "expired",
            VerificationError::AlreadyUsed => "already_used",
            VerificationError::InvalidAmount => "invalid_amount",
            VerificationError::InsufficientBalance { .. } => "insufficient_balance",
            VerificationError::CardLocked { .. } => "card_locked",
            VerificationError::TooManyAttempts { .. } => "too_many_attempts",
            VerificationError::RetailerMismatch => "retailer_mismatch",
        }
    }

    /// Whether this failure feeds the 15-minute lockout window.
    ///
    /// Declines caused by the lock itself or by the card's funds do not.
    pub fn counts_toward_lockout(&self) -> bool {
        !matches!(
            self,
            VerificationError::InsufficientBalance { .. }
                | VerificationError::CardLocked { .. }
                | VerificationError::TooManyAttempts { .. }
                | VerificationError::InvalidAmount
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VerificationError::CardNotFound => StatusCode::NOT_FOUND,
            VerificationError::CardInactive => StatusCode::FORBIDDEN,
            VerificationError::InvalidPin | VerificationError::InvalidCode => {
                StatusCode::UNAUTHORIZED
            }
            VerificationError::Expired | VerificationError::AlreadyUsed => StatusCode::GONE,
            VerificationError::InvalidAmount => StatusCode::BAD_REQUEST,
            VerificationError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            VerificationError::CardLocked { .. } => StatusCode::LOCKED,
            VerificationError::TooManyAttempts { .. } => StatusCode::TOO_MANY_REQUESTS,
            VerificationError::RetailerMismatch => StatusCode::FORBIDDEN,
        }
    }
}

/// 결제 거절 응답 본문
#[derive(Debug, Serialize)]
pub struct DeclineResponse {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

impl From<&VerificationError> for DeclineResponse {
    fn from(err: &VerificationError) -> Self {
        let (balance, locked_until) = match err {
            VerificationError::InsufficientBalance { balance } => (Some(*balance), None),
            VerificationError::CardLocked { until }
            | VerificationError::TooManyAttempts { until } => (None, Some(*until)),
            _ => (None, None),
        };
        Self {
            success: false,
            error: err.to_string(),
            code: err.code(),
            balance,
            locked_until,
        }
    }
}

impl IntoResponse for VerificationError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(DeclineResponse::from(&self))).into_response()
    }
}

/// 에스크로 처리 에러
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("Escrow {0} not found or no longer held")]
    NotFoundOrAlreadyReleased(Uuid),

    #[error("Escrow {0} not found")]
    NotFound(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid auto-deduction setting: {0}")]
    InvalidSetting(String),

    #[error("Escrow {escrow_id} is {status} and cannot be repaid")]
    NotRepayable { escrow_id: Uuid, status: EscrowStatus },

    #[error("Escrow belongs to a different retailer")]
    RetailerMismatch,

    #[error("Repayment exceeds outstanding debt of {outstanding}")]
    RepaymentExceedsDebt { outstanding: i64 },

    #[error("Repayment method auto_deduct is reserved for scheduled deductions")]
    ReservedMethod,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// API 에러 타입
///
/// 각 variant는 HTTP 상태 코드에 매핑됨. 내부 정보는 클라이언트에 노출하지 않음.
#[derive(Debug, Error)]
pub enum ApiError {
    // ============ 400 Bad Request ============
    #[error("Validation failed: {0}")]
    ValidationError(String),

    // ============ 404 Not Found ============
    #[error("Resource not found: {0}")]
    NotFound(String),

    // ============ 409 Conflict ============
    #[error("Conflict: {0}")]
    Conflict(String),

    // ============ 422 Unprocessable Entity ============
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    // ============ 500 Internal Server Error ============
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal server error")]
    InternalError,
}

/// API 에러 응답 구조
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            // 4xx 클라이언트 에러
            ApiError::ValidationError(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "Validation failed".to_string(),
                Some(msg.clone()),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{} not found", resource),
                None,
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None),
            ApiError::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNPROCESSABLE",
                "Request cannot be applied".to_string(),
                Some(msg.clone()),
            ),

            // 5xx 서버 에러
            ApiError::DatabaseError(_) => {
                tracing::error!("Database error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database error occurred".to_string(),
                    None,
                )
            }
            ApiError::InternalError => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::NotFoundOrAlreadyReleased(_) => ApiError::Conflict(err.to_string()),
            EscrowError::NotFound(id) => ApiError::NotFound(format!("Escrow {}", id)),
            EscrowError::InvalidAmount(msg) | EscrowError::InvalidSetting(msg) => {
                ApiError::ValidationError(msg)
            }
            EscrowError::ReservedMethod => ApiError::ValidationError(err.to_string()),
            EscrowError::NotRepayable { .. }
            | EscrowError::RetailerMismatch
            | EscrowError::RepaymentExceedsDebt { .. } => ApiError::Unprocessable(err.to_string()),
            EscrowError::Storage(inner) => ApiError::from(inner),
        }
    }
}

/// SQLx 에러를 ApiError로 변환
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("SQLx error: {:?}", err);
        ApiError::DatabaseError(err.to_string())
    }
}

/// anyhow 에러를 ApiError로 변환
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {:?}", err);
        ApiError::InternalError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockout_counting_excludes_balance_and_lock_declines() {
        assert!(VerificationError::InvalidPin.counts_toward_lockout());
        assert!(VerificationError::RetailerMismatch.counts_toward_lockout());
        assert!(!VerificationError::InsufficientBalance { balance: 10 }.counts_toward_lockout());
        assert!(!VerificationError::CardLocked { until: Utc::now() }.counts_toward_lockout());
    }

    #[test]
    fn test_decline_body_carries_balance() {
        let body = DeclineResponse::from(&VerificationError::InsufficientBalance { balance: 4_200 });
        assert!(!body.success);
        assert_eq!(body.code, "insufficient_balance");
        assert_eq!(body.balance, Some(4_200));
        assert!(body.locked_until.is_none());
    }

    #[test]
    fn test_escrow_error_http_mapping() {
        let id = Uuid::new_v4();
        let resp = ApiError::from(EscrowError::NotFoundOrAlreadyReleased(id)).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError::from(EscrowError::NotFound(id)).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::from(EscrowError::RepaymentExceedsDebt { outstanding: 5 }).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
