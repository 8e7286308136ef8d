//! SMS delivery and operator alerting.
//!
//! SMS 발송은 best-effort: 결제 흐름에서는 실패를 로그로만 남긴다.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, message: &str) -> Result<()>;
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    message: &'a str,
}

/// HTTP SMS 게이트웨이 (`POST {base_url}/send`)
pub struct HttpSmsGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSmsGateway {
    const TIMEOUT_SECS: u64 = 5;

    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::TIMEOUT_SECS))
            .build()
            .context("Failed to build SMS HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/send", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SmsSender for HttpSmsGateway {
    async fn send(&self, to: &str, message: &str) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&SmsRequest { to, message })
            .send()
            .await
            .context("SMS gateway request failed")?
            .error_for_status()
            .context("SMS gateway rejected message")?;
        Ok(())
    }
}

/// 게이트웨이 URL이 없을 때 쓰는 로그 전용 발송기.
/// 메시지 본문에는 코드가 들어 있으므로 길이만 기록한다.
#[derive(Debug, Default)]
pub struct TracingSms;

#[async_trait]
impl SmsSender for TracingSms {
    async fn send(&self, to: &str, message: &str) -> Result<()> {
        tracing::info!(to, length = message.len(), "SMS (local only)");
        Ok(())
    }
}

/// 운영자 알림
#[derive(Clone)]
pub struct AlertDispatcher {
    sms: Arc<dyn SmsSender>,
    recipients: Vec<String>,
}

impl AlertDispatcher {
    pub fn new(sms: Arc<dyn SmsSender>, recipients: Vec<String>) -> Self {
        Self { sms, recipients }
    }

    /// Best-effort fan-out; returns how many recipients were reached.
    pub async fn dispatch(&self, subject: &str, detail: &str) -> usize {
        if self.recipients.is_empty() {
            tracing::warn!(subject, "No alert recipients configured");
            return 0;
        }

        let message = format!("[escrow-settlement] {}: {}", subject, detail);
        let mut delivered = 0;
        for recipient in &self.recipients {
            match self.sms.send(recipient, &message).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(recipient = %recipient, "Alert delivery failed: {:#}", e),
            }
        }
        delivered
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSms {
        sent: Mutex<Vec<(String, String)>>,
        failing: AtomicBool,
    }

    impl FakeSms {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_all(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SmsSender for FakeSms {
        async fn send(&self, to: &str, message: &str) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("gateway down");
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), message.to_string()));
            Ok(())
        }
    }
}
