//! Escrow & Credit Settlement API Server
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Order system / Admin console / POS terminals          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum Web Server                         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                      Routes Layer                        ││
//! │  │  /health  /api/scheduler/*  /api/escrow/*  /api/payments ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Services Layer                        ││
//! │  │  EscrowService  ManualPaymentEngine  SettlementScheduler ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Data Layer                            ││
//! │  │  PostgreSQL (sqlx)                                       ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Ledger service        SMS gateway               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use escrow_settlement::{
    clock::{offset_label, Clock, SystemClock},
    routes,
    services::{
        AlertDispatcher, EscrowSettings, HttpLedgerClient, HttpSmsGateway, ScheduleSettings,
        SmsSender, TracingLedger, TracingSms, TransactionRecorder,
    },
    AppState, Config, Database, EscrowService, ManualPaymentEngine, SettlementScheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "escrow_settlement=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Escrow & Credit Settlement API Server");

    // 설정 로드
    let config = Config::from_env()?;
    tracing::info!(
        environment = ?config.environment,
        timezone = %offset_label(config.business_offset),
        "Configuration loaded"
    );

    // 데이터베이스 연결
    let db = Arc::new(Database::connect(&config.database_url).await?);
    tracing::info!("Database connected");

    // 마이그레이션 실행
    db.run_migrations().await?;
    tracing::info!("Migrations completed");

    // 외부 연동: URL이 없으면 로그 전용 구현
    let ledger: Arc<dyn TransactionRecorder> = match &config.ledger_url {
        Some(url) => {
            tracing::info!(%url, "Ledger client configured");
            Arc::new(HttpLedgerClient::new(url)?)
        }
        None => {
            tracing::warn!("LEDGER_URL not set, ledger entries are only logged");
            Arc::new(TracingLedger)
        }
    };
    let sms: Arc<dyn SmsSender> = match &config.sms_gateway_url {
        Some(url) => {
            tracing::info!(%url, "SMS gateway configured");
            Arc::new(HttpSmsGateway::new(url)?)
        }
        None => {
            tracing::warn!("SMS_GATEWAY_URL not set, SMS messages are only logged");
            Arc::new(TracingSms)
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // 서비스 초기화
    let escrow = Arc::new(EscrowService::new(
        db.clone(),
        db.clone(),
        ledger.clone(),
        clock.clone(),
        EscrowSettings {
            currency: config.currency.clone(),
            auto_release_days: config.auto_release_days,
            business_offset: config.business_offset,
        },
    ));
    let payments = Arc::new(ManualPaymentEngine::new(
        db.clone(),
        db.clone(),
        ledger,
        sms.clone(),
        clock.clone(),
        config.currency.clone(),
    ));
    let scheduler = SettlementScheduler::new(
        escrow.clone(),
        payments.clone(),
        AlertDispatcher::new(sms, config.alert_phones.clone()),
        clock,
        ScheduleSettings {
            business_offset: config.business_offset,
            auto_release_at: config.auto_release_at,
            auto_deduct_at: config.auto_deduct_at,
            cleanup_interval: config.cleanup_interval,
        },
    );
    scheduler.start_all().await;
    tracing::info!("Scheduler started");

    // 앱 상태 구성
    let state = AppState {
        store: db,
        escrow,
        payments,
        scheduler: scheduler.clone(),
        config: Arc::new(config.clone()),
    };

    // 라우터 구성
    let app = create_router(state);

    // 서버 시작
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop_all().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// 라우터에 CORS / 트레이싱 미들웨어 적용
fn create_router(state: AppState) -> Router {
    // CORS 설정
    // 프로덕션: ALLOWED_ORIGINS에 나열된 도메인만 허용
    // 개발: localhost 허용
    let cors = if state.config.is_production() {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS").unwrap_or_default();
        let origins: Vec<_> = allowed_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin([
                axum::http::HeaderValue::from_static("http://localhost:5173"),  // Vite dev server
                axum::http::HeaderValue::from_static("http://localhost:3000"),
                axum::http::HeaderValue::from_static("http://127.0.0.1:5173"),
            ])
            .allow_methods(Any)
            .allow_headers(Any)
    };

    routes::router(state)
        // 미들웨어
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
