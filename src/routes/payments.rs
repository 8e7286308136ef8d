//! Manual Card Payment Endpoints
//!
//! 결제 거절은 에러가 아닌 구조화된 응답
//! (`{success: false, error, code, balance?, locked_until?}`)으로 돌려준다.
//! 클라이언트 IP는 `X-Forwarded-For`의 첫 항목, 단말 정보는 `User-Agent`.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, VerificationError};
use crate::services::ChargeContext;
use crate::AppState;

// ============ Request Types ============

#[derive(Debug, Deserialize)]
pub struct PinPaymentRequest {
    pub card_uid: String,
    pub pin: String,
    pub amount: i64,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateCodeRequest {
    pub card_uid: String,
    pub amount: i64,
    pub customer_phone: String,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub card_uid: String,
    pub code: String,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub card_uid: String,
    pub phone: String,
    pub amount: i64,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    pub card_uid: String,
    pub phone: String,
    pub otp: String,
    pub retailer_id: Uuid,
    pub branch_id: Option<Uuid>,
}

// ============ Handlers ============

/// POST /api/payments/pin
pub async fn pay_with_pin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PinPaymentRequest>,
) -> Result<Response, ApiError> {
    require("card_uid", &req.card_uid)?;
    let ctx = charge_context(&headers, req.retailer_id, req.branch_id);
    let outcome = state
        .payments
        .verify_pin_and_charge(&req.card_uid, &req.pin, req.amount, &ctx)
        .await?;
    Ok(respond(outcome))
}

/// POST /api/payments/code
///
/// 코드는 응답에 포함되지 않고 고객 휴대폰으로만 전송된다.
pub async fn generate_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateCodeRequest>,
) -> Result<Response, ApiError> {
    require("card_uid", &req.card_uid)?;
    require("customer_phone", &req.customer_phone)?;
    let ctx = charge_context(&headers, req.retailer_id, req.branch_id);
    let outcome = state
        .payments
        .generate_payment_code(&req.card_uid, req.amount, &req.customer_phone, &ctx)
        .await?;
    Ok(respond(outcome))
}

/// POST /api/payments/code/verify
pub async fn verify_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyCodeRequest>,
) -> Result<Response, ApiError> {
    require("card_uid", &req.card_uid)?;
    let ctx = charge_context(&headers, req.retailer_id, req.branch_id);
    let outcome = state
        .payments
        .verify_code_and_charge(&req.card_uid, &req.code, &ctx)
        .await?;
    Ok(respond(outcome))
}

/// POST /api/payments/otp
pub async fn request_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OtpRequest>,
) -> Result<Response, ApiError> {
    require("card_uid", &req.card_uid)?;
    require("phone", &req.phone)?;
    let ctx = charge_context(&headers, req.retailer_id, req.branch_id);
    let outcome = state
        .payments
        .request_payment_otp(&req.card_uid, &req.phone, req.amount, &ctx)
        .await?;
    Ok(respond(outcome))
}

/// POST /api/payments/otp/verify
pub async fn verify_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<Response, ApiError> {
    require("card_uid", &req.card_uid)?;
    require("phone", &req.phone)?;
    let ctx = charge_context(&headers, req.retailer_id, req.branch_id);
    let outcome = state
        .payments
        .verify_otp_and_charge(&req.card_uid, &req.phone, &req.otp, &ctx)
        .await?;
    Ok(respond(outcome))
}

// ============ Helpers ============

fn respond<T: Serialize>(outcome: Result<T, VerificationError>) -> Response {
    match outcome {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(decline) => decline.into_response(),
    }
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::ValidationError(format!("{} is required", field)));
    }
    Ok(())
}

fn charge_context(headers: &HeaderMap, retailer_id: Uuid, branch_id: Option<Uuid>) -> ChargeContext {
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ChargeContext {
        retailer_id,
        branch_id,
        ip_address,
        user_agent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_context_takes_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("41.186.12.9, 10.0.0.1"),
        );
        headers.insert(header::USER_AGENT, HeaderValue::from_static("pos/1.0"));

        let ctx = charge_context(&headers, Uuid::new_v4(), None);
        assert_eq!(ctx.ip_address.as_deref(), Some("41.186.12.9"));
        assert_eq!(ctx.user_agent.as_deref(), Some("pos/1.0"));
    }

    #[test]
    fn test_context_without_headers() {
        let ctx = charge_context(&HeaderMap::new(), Uuid::new_v4(), None);
        assert!(ctx.ip_address.is_none());
        assert!(ctx.user_agent.is_none());
    }
}
