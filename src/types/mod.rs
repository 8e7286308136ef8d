//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의

use std::fmt::Display;

use serde::Serialize;

/// 구조화된 성공/실패 응답
///
/// 관리자 트리거처럼 실패해도 예외 대신 `{success: false, error}`를
/// 돌려줘야 하는 곳에서 사용.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message),
        }
    }

    pub fn from_result<E: Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// `1500000` → `1,500,000 RWF`
pub fn format_amount(amount: i64, currency: &str) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{}{} {}", sign, grouped, currency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_error() {
        let resp: ApiResponse<u32> = ApiResponse::from_result(Err("boom"));
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("boom"));
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_success_serializes_without_error_field() {
        let json = serde_json::to_value(ApiResponse::success(3)).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true, "result": 3 }));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1_500_000, "RWF"), "1,500,000 RWF");
        assert_eq!(format_amount(999, "RWF"), "999 RWF");
        assert_eq!(format_amount(-12_000, "RWF"), "-12,000 RWF");
    }
}
