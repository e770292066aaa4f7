use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use retouch_core::config::{AppConfig, CreditPackage};
use retouch_core::error::LedgerError;
use retouch_core::types::{
    ApiResponse, BalanceResponse, ConfirmPaymentRequest, ConfirmPaymentResponse, HealthResponse,
    LinkReferralRequest, ReferralStatsResponse, StartTaskResponse,
};

mod gateway;
mod ledger;
mod notifier;
mod referral;
mod store;
mod sweeper;
mod webhook;

use gateway::GatewayClient;
use ledger::TaskLifecycle;
use notifier::Notifier;
use referral::ReferralLedger;
use store::Store;

const TASK_UPLOAD_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    started_at: Instant,
    pub(crate) store: Store,
    pub(crate) tasks: TaskLifecycle,
    pub(crate) referral: ReferralLedger,
    pub(crate) gateway: GatewayClient,
    pub(crate) notifier: Notifier,
    packages: Arc<Vec<CreditPackage>>,
    pub(crate) task_timeout: Duration,
    pub(crate) sweep_interval_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // info by default, RUST_LOG wins when set
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(false)
        .compact()
        .init();

    let config = AppConfig::load("configs/config.toml")?;
    let store = Store::open(&config.database)?;

    let task_timeout = Duration::from_secs(config.tasks.timeout_minutes.max(1) * 60);
    let gateway = GatewayClient::new(&config.gateway)?;
    let notifier = Notifier::new(config.telegram.bot_token.clone());
    let tasks = TaskLifecycle::new(store.clone(), task_timeout);
    let referral = ReferralLedger::new(
        store.clone(),
        config.referral.bonus_rate,
        config.referral.max_chain_depth,
    );

    info!(
        "task config: timeout_minutes={} sweep_interval_seconds={}",
        config.tasks.timeout_minutes, config.tasks.sweep_interval_seconds
    );
    info!(
        "gateway config: base_url={} timeout_seconds={} retry_max_attempts={}",
        config.gateway.base_url, config.gateway.timeout_seconds, config.gateway.retry_max_attempts
    );
    info!(
        "referral config: bonus_rate={} max_chain_depth={}",
        config.referral.bonus_rate, config.referral.max_chain_depth
    );
    info!("packages loaded: count={}", config.packages.len());

    let state = AppState {
        started_at: Instant::now(),
        store,
        tasks,
        referral,
        gateway,
        notifier,
        packages: Arc::new(config.packages.clone()),
        task_timeout,
        sweep_interval_seconds: config.tasks.sweep_interval_seconds,
    };

    sweeper::spawn_sweeper(state.clone());

    let app = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/users/:user_id/balance", get(get_balance))
        .route("/v1/users/:user_id/referral", get(referral_stats))
        .route("/v1/referrals", post(link_referral))
        .route("/v1/payments/confirm", post(confirm_payment))
        .route(
            "/v1/tasks",
            post(start_task).layer(DefaultBodyLimit::max(TASK_UPLOAD_LIMIT)),
        )
        .route(
            "/gateway/webhook",
            post(webhook::gateway_webhook).layer(DefaultBodyLimit::max(webhook::WEBHOOK_BODY_LIMIT)),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!("retouchd listening on {}", config.server.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

pub(crate) fn now_ts_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn now_ts() -> String {
    now_ts_u64().to_string()
}

fn domain_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
        LedgerError::TaskAlreadyActive { .. } => StatusCode::CONFLICT,
        LedgerError::VendorUnavailable(_) | LedgerError::VendorQuotaExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LedgerError::UnknownTask | LedgerError::ReferrerNotFound => StatusCode::NOT_FOUND,
        LedgerError::SelfReferral | LedgerError::CyclicReferral => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::AlreadyLinked => StatusCode::CONFLICT,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Messages the chat collaborator relays verbatim; each domain condition gets
/// its own wording so the user knows whether to pay, wait or retry.
fn user_facing_message(err: &LedgerError) -> String {
    match err {
        LedgerError::InsufficientCredits => {
            "❌ You have no credits left.\nTop up your balance to start processing.".to_string()
        }
        LedgerError::TaskAlreadyActive { remaining_minutes } => format!(
            "⚠️ You already have a task in processing, about {remaining_minutes} minutes left.\n\
             Please wait for it to finish."
        ),
        LedgerError::VendorQuotaExhausted => {
            "⚠️ The processing service is temporarily out of capacity.\n\
             Please try again later, your credits are kept."
                .to_string()
        }
        LedgerError::VendorUnavailable(_) => {
            "❌ Could not reach the processing service.\n\
             Please try again later, your credits are kept."
                .to_string()
        }
        other => other.to_string(),
    }
}

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let users = state.store.count_users().unwrap_or_default();
    let pending_tasks = state.store.count_pending_tasks().unwrap_or_default();
    Json(ApiResponse::ok(HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        users,
        pending_tasks,
    }))
}

async fn get_balance(
    State(state): State<AppState>,
    AxumPath(user_id): AxumPath<i64>,
) -> (StatusCode, Json<ApiResponse<BalanceResponse>>) {
    match state.store.get_balance(user_id) {
        Ok(credits) => (
            StatusCode::OK,
            Json(ApiResponse::ok(BalanceResponse { user_id, credits })),
        ),
        Err(err) => {
            error!("read balance failed: user_id={} err={}", user_id, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("Database error")),
            )
        }
    }
}

/// Multipart submission from the chat collaborator: `user_id` plus the image
/// bytes it already downloaded from the chat platform.
async fn start_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> (StatusCode, Json<ApiResponse<StartTaskResponse>>) {
    let mut user_id: Option<i64> = None;
    let mut username: Option<String> = None;
    let mut image: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("start_task multipart read failed: err={}", err);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::err("invalid multipart body")),
                );
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "user_id" => {
                user_id = field.text().await.ok().and_then(|v| v.trim().parse().ok());
            }
            "username" => {
                username = field.text().await.ok().filter(|v| !v.trim().is_empty());
            }
            "image" => {
                image = field.bytes().await.ok().map(|b| b.to_vec());
            }
            other => debug!("start_task ignoring multipart field: {}", other),
        }
    }

    let Some(user_id) = user_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::err("missing user_id field")),
        );
    };
    let Some(image) = image.filter(|b| !b.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::err("missing image field")),
        );
    };

    if let Err(err) = state.store.ensure_user(user_id, username.as_deref()) {
        error!("ensure user failed: user_id={} err={}", user_id, err);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("Database error")),
        );
    }

    let now = now_ts_u64() as i64;
    let gateway = state.gateway.clone();
    let result = state
        .tasks
        .start_task(user_id, now, move |task_id| async move {
            gateway.submit(image, &task_id).await
        })
        .await;

    match result {
        Ok(started) => (
            StatusCode::OK,
            Json(ApiResponse::ok(StartTaskResponse {
                task_id: started.task_id,
                queue_num: started.ack.queue_num,
                queue_time: started.ack.queue_time,
            })),
        ),
        Err(err) => {
            let status = domain_status(&err);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("start_task failed: user_id={} err={}", user_id, err);
            }
            (status, Json(ApiResponse::err(user_facing_message(&err))))
        }
    }
}

/// One payment-provider confirmation event. The UNIQUE payment id makes this
/// idempotent: a redelivered confirmation grants nothing and pays no second
/// referral bonus.
async fn confirm_payment(
    State(state): State<AppState>,
    Json(req): Json<ConfirmPaymentRequest>,
) -> (StatusCode, Json<ApiResponse<ConfirmPaymentResponse>>) {
    let Some(package) = state
        .packages
        .iter()
        .find(|p| p.id == req.package_id)
        .cloned()
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("package not found")),
        );
    };

    if let Err(err) = state.store.ensure_user(req.user_id, req.username.as_deref()) {
        error!("ensure user failed: user_id={} err={}", req.user_id, err);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("Database error")),
        );
    }

    match state
        .store
        .record_payment(req.user_id, &req.payment_id, package.price, package.credits)
    {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                "duplicate payment confirmation ignored: user_id={} payment_id={}",
                req.user_id, req.payment_id
            );
            return (
                StatusCode::OK,
                Json(ApiResponse::ok(ConfirmPaymentResponse {
                    credits_added: 0,
                    referral_bonus: None,
                })),
            );
        }
        Err(err) => {
            error!(
                "record payment failed: user_id={} payment_id={} err={}",
                req.user_id, req.payment_id, err
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("Database error")),
            );
        }
    }

    if let Err(err) = state.store.credit(req.user_id, package.credits) {
        error!(
            "grant credits failed: user_id={} payment_id={} err={}",
            req.user_id, req.payment_id, err
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("Database error")),
        );
    }

    let referral_bonus = match state.referral.apply_purchase_bonus(req.user_id, package.price) {
        Ok(Some((referrer_id, bonus))) => {
            let text = format!(
                "🎁 You received a referral bonus of {bonus:.2} from a payment by your referral!"
            );
            if let Err(err) = state.notifier.send_text(referrer_id, &text).await {
                warn!(
                    "referral bonus notice undelivered: referrer_id={} err={}",
                    referrer_id, err
                );
            }
            Some(bonus)
        }
        Ok(None) => None,
        Err(err) => {
            // the grant already committed; the bonus failure is its own problem
            error!(
                "apply referral bonus failed: user_id={} err={}",
                req.user_id, err
            );
            None
        }
    };

    info!(
        "payment confirmed: user_id={} payment_id={} credits={} bonus={:?}",
        req.user_id, req.payment_id, package.credits, referral_bonus
    );
    (
        StatusCode::OK,
        Json(ApiResponse::ok(ConfirmPaymentResponse {
            credits_added: package.credits,
            referral_bonus,
        })),
    )
}

async fn link_referral(
    State(state): State<AppState>,
    Json(req): Json<LinkReferralRequest>,
) -> (StatusCode, Json<ApiResponse<Value>>) {
    if let Err(err) = state.store.ensure_user(req.user_id, None) {
        error!("ensure user failed: user_id={} err={}", req.user_id, err);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("Database error")),
        );
    }

    match state.referral.link_referral(req.user_id, req.referrer_id) {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::ok(json!({ "status": "linked" }))),
        ),
        Err(err) => {
            let status = domain_status(&err);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(
                    "link referral failed: user_id={} referrer_id={} err={}",
                    req.user_id, req.referrer_id, err
                );
            }
            (status, Json(ApiResponse::err(err.to_string())))
        }
    }
}

async fn referral_stats(
    State(state): State<AppState>,
    AxumPath(user_id): AxumPath<i64>,
) -> (StatusCode, Json<ApiResponse<ReferralStatsResponse>>) {
    match state.referral.stats(user_id) {
        Ok((total_referrals, referral_earnings)) => (
            StatusCode::OK,
            Json(ApiResponse::ok(ReferralStatsResponse {
                user_id,
                total_referrals,
                referral_earnings,
            })),
        ),
        Err(err) => {
            error!("read referral stats failed: user_id={} err={}", user_id, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("Database error")),
            )
        }
    }
}
