use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Terminal verdict a webhook callback delivers for an in-flight task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskResponse {
    pub task_id: String,
    pub queue_num: i64,
    pub queue_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: i64,
    pub credits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub payment_id: String,
    pub package_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPaymentResponse {
    pub credits_added: i64,
    pub referral_bonus: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkReferralRequest {
    pub user_id: i64,
    pub referrer_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralStatsResponse {
    pub user_id: i64,
    pub total_referrals: i64,
    pub referral_earnings: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub users: i64,
    /// 当前仍在等待回调的任务数量
    pub pending_tasks: i64,
}
