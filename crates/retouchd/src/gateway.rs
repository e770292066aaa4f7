use std::fmt;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use retouch_core::config::GatewayConfig;

/// Client for the external image-processing vendor. Submission is
/// fire-and-wait-for-webhook: the response only acknowledges queueing, the
/// result arrives later at `/gateway/webhook`.
#[derive(Clone)]
pub(crate) struct GatewayClient {
    client: Client,
    base_url: String,
    api_key: String,
    webhook_base_url: String,
    retry: RetryPolicy,
}

/// Bounded retry with linear backoff, applied to transport failures only.
/// Application-level rejections propagate on the first attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub(crate) fn delay(&self, attempt: usize) -> Duration {
        self.backoff * attempt as u32
    }
}

#[derive(Debug)]
pub(crate) enum GatewayError {
    /// Transport failure that survived every retry the policy allows.
    Unavailable(String),
    /// The vendor's own balance is exhausted; never retried, the user's
    /// credit must be preserved.
    QuotaExhausted,
    /// Application-level rejection; never retried.
    Rejected(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Unavailable(msg) => write!(f, "gateway unavailable: {msg}"),
            GatewayError::QuotaExhausted => write!(f, "vendor balance exhausted"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected submission: {msg}"),
        }
    }
}

enum SubmitError {
    Retryable(String),
    Quota,
    Fatal(String),
}

#[derive(Debug, Clone)]
pub(crate) struct SubmitAck {
    pub queue_num: i64,
    pub queue_time: i64,
    pub api_balance: f64,
}

impl GatewayClient {
    pub(crate) fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            webhook_base_url: config.webhook_base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts.max(1),
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        })
    }

    /// The callback URL registered with each submission. The task id rides
    /// along as a query parameter so raw-bytes callbacks, which carry no
    /// parseable body fields, stay correlatable.
    fn callback_url(&self, task_id: &str) -> String {
        format!("{}/gateway/webhook?id_gen={}", self.webhook_base_url, task_id)
    }

    pub(crate) async fn submit(
        &self,
        image: Vec<u8>,
        task_id: &str,
    ) -> Result<SubmitAck, GatewayError> {
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            match self.submit_once(image.clone(), task_id).await {
                Ok(ack) => {
                    info!(
                        "gateway accepted submission: task_id={} queue_num={} api_balance={}",
                        task_id, ack.queue_num, ack.api_balance
                    );
                    return Ok(ack);
                }
                Err(SubmitError::Retryable(err)) => {
                    if attempts >= self.retry.max_attempts {
                        return Err(GatewayError::Unavailable(err));
                    }
                    warn!(
                        "gateway submit retry: task_id={} attempt={} err={}",
                        task_id, attempts, err
                    );
                    tokio::time::sleep(self.retry.delay(attempts)).await;
                }
                Err(SubmitError::Quota) => return Err(GatewayError::QuotaExhausted),
                Err(SubmitError::Fatal(err)) => return Err(GatewayError::Rejected(err)),
            }
        }
    }

    async fn submit_once(&self, image: Vec<u8>, task_id: &str) -> Result<SubmitAck, SubmitError> {
        let part = Part::bytes(image)
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|err| SubmitError::Fatal(format!("build image part failed: {err}")))?;
        let form = Form::new()
            .part("image", part)
            .text("id_gen", task_id.to_string())
            .text("webhook", self.callback_url(task_id));

        let resp = self
            .client
            .post(format!("{}/process", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("accept", "application/json")
            .multipart(form)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SubmitError::Retryable(format!("timeout: {err}"))
                } else {
                    SubmitError::Retryable(format!("request failed: {err}"))
                }
            })?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|err| SubmitError::Retryable(format!("read response failed: {err}")))?;

        if !status.is_success() {
            let error_msg = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(classify_rejection(status.as_u16(), error_msg));
        }

        Ok(SubmitAck {
            queue_num: body.get("queue_num").and_then(|v| v.as_i64()).unwrap_or(0),
            queue_time: body.get("queue_time").and_then(|v| v.as_i64()).unwrap_or(0),
            api_balance: body
                .get("api_balance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        })
    }
}

fn classify_rejection(status: u16, error_msg: &str) -> SubmitError {
    if error_msg == "Insufficient balance" {
        return SubmitError::Quota;
    }
    if status >= 500 {
        return SubmitError::Retryable(format!("status={status} error={error_msg}"));
    }
    SubmitError::Fatal(format!("status={status} error={error_msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_balance_error_maps_to_quota() {
        assert!(matches!(
            classify_rejection(400, "Insufficient balance"),
            SubmitError::Quota
        ));
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(matches!(
            classify_rejection(502, "bad gateway"),
            SubmitError::Retryable(_)
        ));
        assert!(matches!(
            classify_rejection(400, "bad image"),
            SubmitError::Fatal(_)
        ));
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
    }
}
