//! Scheduler Admin Endpoints
//!
//! 수동 트리거는 실패해도 200으로 `{success: false, error}`를 돌려준다.

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::Value;

use crate::services::{JobStatus, NextRunTimes};
use crate::types::ApiResponse;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SchedulerStatusResponse {
    pub jobs: Vec<JobStatus>,
}

/// GET /api/scheduler/status
pub async fn get_status(State(state): State<AppState>) -> Json<SchedulerStatusResponse> {
    Json(SchedulerStatusResponse {
        jobs: state.scheduler.status().await,
    })
}

/// POST /api/scheduler/trigger-auto-release
pub async fn trigger_auto_release(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    Json(state.scheduler.trigger_auto_release().await)
}

/// POST /api/scheduler/trigger-auto-deduct
pub async fn trigger_auto_deduct(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    Json(state.scheduler.trigger_auto_deduct().await)
}

/// GET /api/scheduler/next-run-times
pub async fn get_next_run_times(State(state): State<AppState>) -> Json<NextRunTimes> {
    Json(state.scheduler.next_run_times())
}
