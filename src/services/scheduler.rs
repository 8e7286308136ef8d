//! Settlement Scheduler
//!
//! Three background jobs:
//!
//! - `auto_release`: daily (default 02:00 business time), releases due escrows
//! - `auto_deduct`: daily (default 23:00 business time), wallet deductions
//! - `cleanup`: fixed interval (default hourly), purges expired codes/OTPs/locks
//!
//! Each run executes in its own task so an error or panic is caught at the
//! job boundary, logged, and sent to operators; the loop then waits for its
//! next slot. A job never overlaps itself, whether started by the timer or by
//! a manual trigger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveTime, Timelike, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::{next_daily_run, offset_label, Clock};
use crate::services::escrow::EscrowService;
use crate::services::payments::ManualPaymentEngine;
use crate::services::sms::AlertDispatcher;
use crate::types::ApiResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AutoRelease,
    AutoDeduct,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::AutoRelease, JobKind::AutoDeduct, JobKind::Cleanup];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::AutoRelease => "auto_release",
            JobKind::AutoDeduct => "auto_deduct",
            JobKind::Cleanup => "cleanup",
        }
    }
}

/// 스케줄 설정 (Config에서 파생)
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub business_offset: FixedOffset,
    pub auto_release_at: NaiveTime,
    pub auto_deduct_at: NaiveTime,
    pub cleanup_interval: StdDuration,
}

impl ScheduleSettings {
    pub const MIN_CLEANUP_INTERVAL: StdDuration = StdDuration::from_secs(1);

    /// Period the cleanup loop actually uses. Never zero.
    pub fn cleanup_period(&self) -> StdDuration {
        self.cleanup_interval.max(Self::MIN_CLEANUP_INTERVAL)
    }
}

/// 직전 실행 결과
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub scheduled: bool,
    pub running: bool,
    /// 일 단위 작업만 cron 표현식을 가짐
    pub cron: Option<String>,
    pub schedule: String,
    pub timezone: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<LastRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextRunTimes {
    pub timezone: String,
    pub auto_release: DateTime<FixedOffset>,
    pub auto_deduct: DateTime<FixedOffset>,
}

/// Clears a job's running flag when the run ends, however it ends.
///
/// Owned by the run task itself, so aborting the loop that started a run
/// leaves the flag set until the run is really over.
struct RunningGuard {
    inner: Arc<Inner>,
    kind: JobKind,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.flag(self.kind).store(false, Ordering::SeqCst);
    }
}

struct Inner {
    escrow: Arc<EscrowService>,
    payments: Arc<ManualPaymentEngine>,
    alerts: AlertDispatcher,
    clock: Arc<dyn Clock>,
    settings: ScheduleSettings,
    auto_release_running: AtomicBool,
    auto_deduct_running: AtomicBool,
    cleanup_running: AtomicBool,
    last_runs: std::sync::Mutex<HashMap<JobKind, LastRun>>,
    next_cleanup: std::sync::Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct SettlementScheduler {
    inner: Arc<Inner>,
    handles: Arc<Mutex<HashMap<JobKind, JoinHandle<()>>>>,
}

impl SettlementScheduler {
    pub fn new(
        escrow: Arc<EscrowService>,
        payments: Arc<ManualPaymentEngine>,
        alerts: AlertDispatcher,
        clock: Arc<dyn Clock>,
        settings: ScheduleSettings,
    ) -> Self {
        if settings.cleanup_interval < ScheduleSettings::MIN_CLEANUP_INTERVAL {
            tracing::warn!(
                configured = ?settings.cleanup_interval,
                used = ?settings.cleanup_period(),
                "Cleanup interval too short, clamped"
            );
        }
        Self {
            inner: Arc::new(Inner {
                escrow,
                payments,
                alerts,
                clock,
                settings,
                auto_release_running: AtomicBool::new(false),
                auto_deduct_running: AtomicBool::new(false),
                cleanup_running: AtomicBool::new(false),
                last_runs: std::sync::Mutex::new(HashMap::new()),
                next_cleanup: std::sync::Mutex::new(None),
            }),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts every job loop that is not already running.
    pub async fn start_all(&self) {
        let mut handles = self.handles.lock().await;
        for kind in JobKind::ALL {
            if handles.get(&kind).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            let inner = self.inner.clone();
            let handle = match kind {
                JobKind::Cleanup => tokio::spawn(inner.interval_loop(kind)),
                _ => tokio::spawn(inner.daily_loop(kind)),
            };
            handles.insert(kind, handle);
            tracing::info!(job = kind.name(), "Scheduled job started");
        }
    }

    /// Stops every job loop. A run already in progress finishes on its own
    /// and keeps its job marked as running until then.
    pub async fn stop_all(&self) {
        let mut handles = self.handles.lock().await;
        for (kind, handle) in handles.drain() {
            handle.abort();
            tracing::info!(job = kind.name(), "Scheduled job stopped");
        }
        if let Ok(mut next) = self.inner.next_cleanup.lock() {
            *next = None;
        }
    }

    pub async fn trigger_auto_release(&self) -> ApiResponse<Value> {
        tracing::info!(job = "auto_release", "Manual trigger");
        ApiResponse::from_result(self.inner.execute(JobKind::AutoRelease).await)
    }

    pub async fn trigger_auto_deduct(&self) -> ApiResponse<Value> {
        tracing::info!(job = "auto_deduct", "Manual trigger");
        ApiResponse::from_result(self.inner.execute(JobKind::AutoDeduct).await)
    }

    pub async fn status(&self) -> Vec<JobStatus> {
        let handles = self.handles.lock().await;
        let settings = &self.inner.settings;
        let timezone = offset_label(settings.business_offset);
        let now = self.inner.clock.now();
        let last_runs = self
            .inner
            .last_runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default();

        JobKind::ALL
            .into_iter()
            .map(|kind| {
                let scheduled = handles.get(&kind).is_some_and(|h| !h.is_finished());
                let (cron, schedule, next_run) = match self.inner.daily_time(kind) {
                    Some(at) => (
                        Some(format!("{} {} * * *", at.minute(), at.hour())),
                        format!("Daily at {} ({})", at.format("%H:%M"), timezone),
                        Some(next_daily_run(now, settings.business_offset, at)),
                    ),
                    None => (
                        None,
                        format!("Every {} seconds", settings.cleanup_period().as_secs()),
                        self.inner.next_cleanup.lock().ok().and_then(|next| *next),
                    ),
                };
                JobStatus {
                    name: kind.name(),
                    scheduled,
                    running: self.inner.flag(kind).load(Ordering::SeqCst),
                    cron,
                    schedule,
                    timezone: timezone.clone(),
                    next_run,
                    last_run: last_runs.get(&kind).cloned(),
                }
            })
            .collect()
    }

    pub fn next_run_times(&self) -> NextRunTimes {
        let settings = &self.inner.settings;
        let offset = settings.business_offset;
        let now = self.inner.clock.now();
        NextRunTimes {
            timezone: offset_label(offset),
            auto_release: next_daily_run(now, offset, settings.auto_release_at)
                .with_timezone(&offset),
            auto_deduct: next_daily_run(now, offset, settings.auto_deduct_at)
                .with_timezone(&offset),
        }
    }
}

impl Inner {
    fn flag(&self, kind: JobKind) -> &AtomicBool {
        match kind {
            JobKind::AutoRelease => &self.auto_release_running,
            JobKind::AutoDeduct => &self.auto_deduct_running,
            JobKind::Cleanup => &self.cleanup_running,
        }
    }

    fn daily_time(&self, kind: JobKind) -> Option<NaiveTime> {
        match kind {
            JobKind::AutoRelease => Some(self.settings.auto_release_at),
            JobKind::AutoDeduct => Some(self.settings.auto_deduct_at),
            JobKind::Cleanup => None,
        }
    }

    async fn daily_loop(self: Arc<Self>, kind: JobKind) {
        let Some(at) = self.daily_time(kind) else {
            return;
        };
        let offset = self.settings.business_offset;

        loop {
            let now = self.clock.now();
            let next = next_daily_run(now, offset, at);
            tracing::debug!(job = kind.name(), next_run = %next, "Waiting for next run");
            tokio::time::sleep((next - now).to_std().unwrap_or(StdDuration::ZERO)).await;

            // 시스템 시계가 단조 시계보다 늦으면 다시 대기
            if self.clock.now() < next {
                continue;
            }
            // Failures are already logged and alerted inside `execute`.
            let _ = self.execute(kind).await;
        }
    }

    async fn interval_loop(self: Arc<Self>, kind: JobKind) {
        let period = self.settings.cleanup_period();
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.set_next_cleanup(period);
            interval.tick().await;
            let _ = self.execute(kind).await;
        }
    }

    fn set_next_cleanup(&self, period: StdDuration) {
        let next = chrono::Duration::from_std(period)
            .ok()
            .map(|d| self.clock.now() + d);
        if let Ok(mut slot) = self.next_cleanup.lock() {
            *slot = next;
        }
    }

    /// Runs one job to completion in its own task.
    async fn execute(self: &Arc<Self>, kind: JobKind) -> std::result::Result<Value, String> {
        if self.flag(kind).swap(true, Ordering::SeqCst) {
            tracing::warn!(job = kind.name(), "Run skipped, previous run still in progress");
            return Err(format!("{} is already running", kind.name()));
        }
        let guard = RunningGuard {
            inner: self.clone(),
            kind,
        };

        // 호출자가 중단돼도 실행 태스크는 끝까지 돌고 그때 플래그를 내린다
        let run = tokio::spawn(async move {
            let result = guard.inner.run_and_record(kind).await;
            drop(guard);
            result
        });
        match run.await {
            Ok(result) => result,
            Err(join_err) => Err(join_err.to_string()),
        }
    }

    async fn run_and_record(self: &Arc<Self>, kind: JobKind) -> std::result::Result<Value, String> {
        tracing::info!(job = kind.name(), "Job run started");
        let inner = self.clone();
        let result = match tokio::spawn(async move { inner.run_job(kind).await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(join_err) if join_err.is_panic() => Err(format!("{} panicked", kind.name())),
            Err(join_err) => Err(join_err.to_string()),
        };

        let finished_at = self.clock.now();
        if let Ok(mut runs) = self.last_runs.lock() {
            runs.insert(
                kind,
                LastRun {
                    finished_at,
                    success: result.is_ok(),
                    error: result.as_ref().err().cloned(),
                },
            );
        }

        match &result {
            Ok(_) => tracing::info!(job = kind.name(), "Job run finished"),
            Err(reason) => {
                tracing::error!(job = kind.name(), error = %reason, "Job run failed");
                self.alerts
                    .dispatch(&format!("{} failed", kind.name()), reason)
                    .await;
            }
        }
        result
    }

    async fn run_job(&self, kind: JobKind) -> Result<Value> {
        match kind {
            JobKind::AutoRelease => {
                let report = self.escrow.process_auto_releases().await?;
                if !report.failures.is_empty() {
                    self.alerts
                        .dispatch(
                            "auto_release completed with failures",
                            &format!(
                                "{} released, {} failed",
                                report.released,
                                report.failures.len()
                            ),
                        )
                        .await;
                }
                Ok(serde_json::to_value(report)?)
            }
            JobKind::AutoDeduct => {
                let report = self.escrow.process_auto_deductions().await?;
                if !report.failures.is_empty() {
                    self.alerts
                        .dispatch(
                            "auto_deduct completed with failures",
                            &format!(
                                "{} processed, {} failed",
                                report.processed,
                                report.failures.len()
                            ),
                        )
                        .await;
                }
                Ok(serde_json::to_value(report)?)
            }
            JobKind::Cleanup => Ok(serde_json::to_value(self.payments.cleanup_expired().await?)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{
        AutoDeductionSetting, DebtTotals, EscrowRepayment, EscrowRepository, EscrowStatus,
        EscrowTransaction, MemoryStore, RepaymentMethod,
    };
    use crate::services::escrow::{EscrowSettings, NewEscrow};
    use crate::services::ledger::fake::FakeLedger;
    use crate::services::sms::fake::FakeSms;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use tokio::sync::Notify;
    use uuid::Uuid;

    /// Escrow store whose every call fails.
    struct BrokenStore;

    /// Due-escrow query that blocks until the test opens the gate.
    struct GatedStore {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl EscrowRepository for GatedStore {
        async fn insert_escrow(&self, e: &EscrowTransaction) -> Result<()> {
            BrokenStore.insert_escrow(e).await
        }
        async fn find_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>> {
            BrokenStore.find_escrow(id).await
        }
        async fn find_held_escrows_past_deadline(
            &self,
            _: DateTime<Utc>,
        ) -> Result<Vec<EscrowTransaction>> {
            self.gate.notified().await;
            Ok(Vec::new())
        }
        async fn transition_escrow(
            &self,
            id: Uuid,
            from: EscrowStatus,
            to: EscrowStatus,
            at: DateTime<Utc>,
        ) -> Result<Option<EscrowTransaction>> {
            BrokenStore.transition_escrow(id, from, to, at).await
        }
        async fn settled_debt_totals(&self, id: Uuid) -> Result<DebtTotals> {
            BrokenStore.settled_debt_totals(id).await
        }
        async fn sum_repayments_since(
            &self,
            id: Uuid,
            method: RepaymentMethod,
            since: DateTime<Utc>,
        ) -> Result<i64> {
            BrokenStore.sum_repayments_since(id, method, since).await
        }
        async fn oldest_settled_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>> {
            BrokenStore.oldest_settled_escrow(id).await
        }
        async fn insert_repayment(&self, r: &EscrowRepayment) -> Result<()> {
            BrokenStore.insert_repayment(r).await
        }
        async fn enabled_auto_deductions(&self) -> Result<Vec<AutoDeductionSetting>> {
            BrokenStore.enabled_auto_deductions().await
        }
        async fn find_auto_deduction(&self, id: Uuid) -> Result<Option<AutoDeductionSetting>> {
            BrokenStore.find_auto_deduction(id).await
        }
        async fn upsert_auto_deduction(
            &self,
            s: &AutoDeductionSetting,
        ) -> Result<AutoDeductionSetting> {
            BrokenStore.upsert_auto_deduction(s).await
        }
    }

    #[async_trait]
    impl EscrowRepository for BrokenStore {
        async fn insert_escrow(&self, _: &EscrowTransaction) -> Result<()> {
            anyhow::bail!("database unreachable")
        }
        async fn find_escrow(&self, _: Uuid) -> Result<Option<EscrowTransaction>> {
            anyhow::bail!("database unreachable")
        }
        async fn find_held_escrows_past_deadline(
            &self,
            _: DateTime<Utc>,
        ) -> Result<Vec<EscrowTransaction>> {
            anyhow::bail!("database unreachable")
        }
        async fn transition_escrow(
            &self,
            _: Uuid,
            _: EscrowStatus,
            _: EscrowStatus,
            _: DateTime<Utc>,
        ) -> Result<Option<EscrowTransaction>> {
            anyhow::bail!("database unreachable")
        }
        async fn settled_debt_totals(&self, _: Uuid) -> Result<DebtTotals> {
            anyhow::bail!("database unreachable")
        }
        async fn sum_repayments_since(
            &self,
            _: Uuid,
            _: RepaymentMethod,
            _: DateTime<Utc>,
        ) -> Result<i64> {
            anyhow::bail!("database unreachable")
        }
        async fn oldest_settled_escrow(&self, _: Uuid) -> Result<Option<EscrowTransaction>> {
            anyhow::bail!("database unreachable")
        }
        async fn insert_repayment(&self, _: &EscrowRepayment) -> Result<()> {
            anyhow::bail!("database unreachable")
        }
        async fn enabled_auto_deductions(&self) -> Result<Vec<AutoDeductionSetting>> {
            anyhow::bail!("database unreachable")
        }
        async fn find_auto_deduction(&self, _: Uuid) -> Result<Option<AutoDeductionSetting>> {
            anyhow::bail!("database unreachable")
        }
        async fn upsert_auto_deduction(
            &self,
            _: &AutoDeductionSetting,
        ) -> Result<AutoDeductionSetting> {
            anyhow::bail!("database unreachable")
        }
    }

    struct Harness {
        escrow: Arc<EscrowService>,
        clock: Arc<ManualClock>,
        sms: Arc<FakeSms>,
        scheduler: SettlementScheduler,
    }

    fn harness_with(repo: Arc<dyn EscrowRepository>) -> Harness {
        harness_with_interval(repo, StdDuration::from_secs(3600))
    }

    fn harness_with_interval(
        repo: Arc<dyn EscrowRepository>,
        cleanup_interval: StdDuration,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let sms = Arc::new(FakeSms::new());
        // 10:00 Kigali
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();

        let escrow = Arc::new(EscrowService::new(
            repo,
            store.clone(),
            ledger.clone(),
            clock.clone(),
            EscrowSettings {
                currency: "RWF".to_string(),
                auto_release_days: 7,
                business_offset: offset,
            },
        ));
        let payments = Arc::new(ManualPaymentEngine::new(
            store.clone(),
            store.clone(),
            ledger,
            sms.clone(),
            clock.clone(),
            "RWF".to_string(),
        ));
        let scheduler = SettlementScheduler::new(
            escrow.clone(),
            payments,
            AlertDispatcher::new(sms.clone(), vec!["+250788000111".to_string()]),
            clock.clone(),
            ScheduleSettings {
                business_offset: offset,
                auto_release_at: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                auto_deduct_at: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
                cleanup_interval,
            },
        );
        Harness {
            escrow,
            clock,
            sms,
            scheduler,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness();
        h.scheduler.stop_all().await;

        h.scheduler.start_all().await;
        h.scheduler.start_all().await;
        assert_eq!(h.scheduler.handles.lock().await.len(), 3);
        assert!(h.scheduler.status().await.iter().all(|s| s.scheduled));

        h.scheduler.stop_all().await;
        h.scheduler.stop_all().await;
        assert!(h.scheduler.status().await.iter().all(|s| !s.scheduled));
    }

    #[tokio::test]
    async fn test_status_reports_schedule() {
        let h = harness();
        let status = h.scheduler.status().await;

        let release = status.iter().find(|s| s.name == "auto_release").unwrap();
        assert_eq!(release.cron.as_deref(), Some("0 2 * * *"));
        assert_eq!(release.timezone, "UTC+02:00");
        assert_eq!(
            release.next_run,
            Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap())
        );

        let deduct = status.iter().find(|s| s.name == "auto_deduct").unwrap();
        assert_eq!(deduct.cron.as_deref(), Some("0 23 * * *"));

        let cleanup = status.iter().find(|s| s.name == "cleanup").unwrap();
        assert!(cleanup.cron.is_none());
        assert!(!cleanup.scheduled);
    }

    #[tokio::test]
    async fn test_next_run_times_in_business_timezone() {
        let h = harness();
        let next = h.scheduler.next_run_times();
        assert_eq!(
            next.auto_deduct.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 6, 1, 21, 0, 0).unwrap()
        );
        assert_eq!(next.auto_release.hour(), 2);
        assert_eq!(next.timezone, "UTC+02:00");
    }

    #[tokio::test]
    async fn test_manual_trigger_releases_due_escrows() {
        let h = harness();
        h.escrow
            .hold_funds(NewEscrow {
                order_id: Uuid::new_v4(),
                retailer_id: Uuid::new_v4(),
                wholesaler_id: Uuid::new_v4(),
                order_amount: 5_000,
                escrow_amount: 5_000,
                auto_release_at: None,
            })
            .await
            .unwrap();
        h.clock.advance(Duration::days(7));

        let response = h.scheduler.trigger_auto_release().await;
        assert!(response.success);
        assert_eq!(response.result.unwrap()["released"], 1);

        let again = h.scheduler.trigger_auto_release().await;
        assert_eq!(again.result.unwrap()["released"], 0);
    }

    #[tokio::test]
    async fn test_failed_run_is_reported_and_alerted() {
        let h = harness_with(Arc::new(BrokenStore));

        let response = h.scheduler.trigger_auto_deduct().await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("database unreachable"));

        let sent = h.sms.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("auto_deduct failed"));

        let status = h.scheduler.status().await;
        let deduct = status.iter().find(|s| s.name == "auto_deduct").unwrap();
        assert!(!deduct.running);
        assert_eq!(deduct.last_run.as_ref().map(|r| r.success), Some(false));
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        let h = harness();
        h.scheduler
            .inner
            .flag(JobKind::AutoRelease)
            .store(true, Ordering::SeqCst);

        let response = h.scheduler.trigger_auto_release().await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("already running"));
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_is_clamped() {
        let h = harness_with_interval(Arc::new(MemoryStore::new()), StdDuration::ZERO);
        h.scheduler.start_all().await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let status = h.scheduler.status().await;
        let cleanup = status.iter().find(|s| s.name == "cleanup").unwrap();
        assert!(cleanup.scheduled);
        assert_eq!(cleanup.schedule, "Every 1 seconds");
        assert_eq!(cleanup.next_run, Some(h.clock.now() + Duration::seconds(1)));

        h.scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn test_stopped_loop_keeps_in_flight_run_exclusive() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(Arc::new(GatedStore { gate: gate.clone() }));
        let flag = |h: &Harness| {
            h.scheduler
                .inner
                .flag(JobKind::AutoRelease)
                .load(Ordering::SeqCst)
        };

        // 스케줄 루프가 실행 도중 중단되는 상황
        let scheduler = h.scheduler.clone();
        let first = tokio::spawn(async move { scheduler.trigger_auto_release().await });
        while !flag(&h) {
            tokio::task::yield_now().await;
        }
        first.abort();
        assert!(first.await.is_err());

        h.scheduler.stop_all().await;
        h.scheduler.start_all().await;
        assert!(flag(&h));

        let overlapping = h.scheduler.trigger_auto_release().await;
        assert!(!overlapping.success);
        assert!(overlapping.error.unwrap().contains("already running"));

        gate.notify_one();
        while flag(&h) {
            tokio::task::yield_now().await;
        }
        let status = h.scheduler.status().await;
        let release = status.iter().find(|s| s.name == "auto_release").unwrap();
        assert_eq!(release.last_run.as_ref().map(|r| r.success), Some(true));

        h.scheduler.stop_all().await;
    }
}
