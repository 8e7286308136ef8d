//! Transaction Recording (external ledger)
//!
//! 원장 서비스는 외부 시스템이다. 결제 승인과 에스크로 지급마다
//! `record_transaction`을 한 번 호출하며, 실패는 호출자에게 그대로 전파된다.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 원장에 기록할 거래
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    /// 고유 참조값 (재시도 시 중복 방지 키)
    pub reference: String,
    pub amount: i64,
    pub source: String,
    pub destination: String,
    pub currency: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

/// 원장 기록 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTransaction {
    pub transaction_id: String,
    pub reference: String,
}

#[async_trait]
pub trait TransactionRecorder: Send + Sync {
    async fn record_transaction(&self, entry: &LedgerEntry) -> Result<RecordedTransaction>;
}

/// HTTP 원장 클라이언트 (`POST {base_url}/transactions`)
pub struct HttpLedgerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLedgerClient {
    /// 요청 타임아웃
    const TIMEOUT_SECS: u64 = 10;

    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::TIMEOUT_SECS))
            .build()
            .context("Failed to build ledger HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/transactions", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TransactionRecorder for HttpLedgerClient {
    async fn record_transaction(&self, entry: &LedgerEntry) -> Result<RecordedTransaction> {
        let recorded = self
            .client
            .post(&self.endpoint)
            .json(entry)
            .send()
            .await
            .with_context(|| format!("Ledger request failed for {}", entry.reference))?
            .error_for_status()
            .with_context(|| format!("Ledger rejected {}", entry.reference))?
            .json::<RecordedTransaction>()
            .await
            .context("Ledger returned an unreadable response")?;

        tracing::debug!(
            reference = %recorded.reference,
            transaction_id = %recorded.transaction_id,
            "Ledger transaction recorded"
        );
        Ok(recorded)
    }
}

/// 원장 URL이 없을 때 쓰는 로그 전용 기록기 (개발 환경)
#[derive(Debug, Default)]
pub struct TracingLedger;

#[async_trait]
impl TransactionRecorder for TracingLedger {
    async fn record_transaction(&self, entry: &LedgerEntry) -> Result<RecordedTransaction> {
        let transaction_id = format!("LOCAL-{}", Uuid::new_v4().simple());
        tracing::info!(
            reference = %entry.reference,
            %transaction_id,
            amount = entry.amount,
            source = %entry.source,
            destination = %entry.destination,
            "Ledger transaction (local only)"
        );
        Ok(RecordedTransaction {
            transaction_id,
            reference: entry.reference.clone(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_ledger_echoes_reference() {
        let entry = LedgerEntry {
            reference: "REF-1".to_string(),
            amount: 1_000,
            source: "card:abc".to_string(),
            destination: "retailer:xyz".to_string(),
            currency: "RWF".to_string(),
            description: "test".to_string(),
            metadata: serde_json::json!({}),
        };
        let recorded = TracingLedger.record_transaction(&entry).await.unwrap();
        assert_eq!(recorded.reference, "REF-1");
        assert!(recorded.transaction_id.starts_with("LOCAL-"));
    }

    #[test]
    fn test_http_client_endpoint() {
        let client = HttpLedgerClient::new("http://ledger.local/").unwrap();
        assert_eq!(client.endpoint, "http://ledger.local/transactions");
    }
}
