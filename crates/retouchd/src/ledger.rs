use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use retouch_core::error::LedgerError;
use retouch_core::types::TaskOutcome;

use crate::gateway::{GatewayError, SubmitAck};
use crate::store::Store;

/// Owns the Idle -> Pending -> Idle state machine for each user's single
/// outstanding task, on top of the store's conditional updates.
#[derive(Clone)]
pub(crate) struct TaskLifecycle {
    store: Store,
    task_timeout: Duration,
}

#[derive(Debug)]
pub(crate) enum TaskState {
    Idle,
    Pending {
        task_id: String,
        remaining_seconds: i64,
    },
}

#[derive(Debug)]
pub(crate) struct StartedTask {
    pub task_id: String,
    pub ack: SubmitAck,
}

impl TaskLifecycle {
    pub(crate) fn new(store: Store, task_timeout: Duration) -> Self {
        Self {
            store,
            task_timeout,
        }
    }

    /// Timeout-aware read of the user's task state. A pending task past the
    /// deadline is reclaimed here and reported as Idle, so callers never see
    /// a stale Pending while the background sweep is still minutes away.
    pub(crate) fn check_active(&self, user_id: i64, now: i64) -> anyhow::Result<TaskState> {
        let Some(pending) = self.store.pending_task(user_id)? else {
            return Ok(TaskState::Idle);
        };

        let timeout = self.task_timeout.as_secs() as i64;
        let age = now - pending.started_at;
        if age > timeout {
            if self.store.reclaim_if_stale(user_id, now - timeout)? {
                info!(
                    "stale task reclaimed inline: user_id={} task_id={} age_seconds={}",
                    user_id, pending.task_id, age
                );
            }
            return Ok(TaskState::Idle);
        }

        Ok(TaskState::Pending {
            task_id: pending.task_id,
            remaining_seconds: timeout - age,
        })
    }

    /// Reserve a credit, submit through `submit`, and record the pending task.
    /// The debit happens before the remote call; any submission failure
    /// refunds it before the error is surfaced, so a failed submission always
    /// nets the balance back to its pre-call value.
    pub(crate) async fn start_task<F, Fut>(
        &self,
        user_id: i64,
        now: i64,
        submit: F,
    ) -> Result<StartedTask, LedgerError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<SubmitAck, GatewayError>>,
    {
        let balance = self
            .store
            .get_balance(user_id)
            .map_err(LedgerError::storage)?;
        if balance <= 0 {
            return Err(LedgerError::InsufficientCredits);
        }

        if let TaskState::Pending {
            remaining_seconds, ..
        } = self
            .check_active(user_id, now)
            .map_err(LedgerError::storage)?
        {
            return Err(LedgerError::TaskAlreadyActive {
                remaining_minutes: (remaining_seconds + 59) / 60,
            });
        }

        // Conditional debit closes the race where two concurrent submissions
        // both read balance 1 above.
        if !self
            .store
            .debit_one(user_id, now)
            .map_err(LedgerError::storage)?
        {
            return Err(LedgerError::InsufficientCredits);
        }

        let task_id = format!("user_{user_id}_{now}");
        match submit(task_id.clone()).await {
            Ok(ack) => {
                self.store
                    .update_pending_task(user_id, &task_id, now)
                    .map_err(LedgerError::storage)?;
                info!(
                    "task started: user_id={} task_id={} queue_num={} queue_time={}",
                    user_id, task_id, ack.queue_num, ack.queue_time
                );
                Ok(StartedTask { task_id, ack })
            }
            Err(err) => {
                // The debit must never outlive a failed submission.
                self.store
                    .credit(user_id, 1)
                    .map_err(LedgerError::storage)?;
                warn!(
                    "submission failed, credit refunded: user_id={} task_id={} err={}",
                    user_id, task_id, err
                );
                Err(match err {
                    GatewayError::QuotaExhausted => LedgerError::VendorQuotaExhausted,
                    GatewayError::Unavailable(msg) | GatewayError::Rejected(msg) => {
                        LedgerError::VendorUnavailable(msg)
                    }
                })
            }
        }
    }

    /// Apply a webhook verdict. `task_id` is matched against the recorded
    /// pending task when the callback carried one; `None` settles the sole
    /// active task, which at-most-one-task-per-user makes unambiguous.
    /// Settling an already-cleared task returns `UnknownTask` and changes
    /// nothing, so vendor-side retries cannot double-refund.
    pub(crate) fn complete_task(
        &self,
        user_id: i64,
        task_id: Option<&str>,
        outcome: &TaskOutcome,
    ) -> Result<(), LedgerError> {
        let settled = match outcome {
            TaskOutcome::Success => self.store.settle_success(user_id, task_id),
            TaskOutcome::Failure(_) => self.store.settle_failure(user_id, task_id),
        }
        .map_err(LedgerError::storage)?;

        if !settled {
            return Err(LedgerError::UnknownTask);
        }

        match outcome {
            TaskOutcome::Success => {
                info!("task completed: user_id={} task_id={:?}", user_id, task_id);
            }
            TaskOutcome::Failure(reason) => {
                info!(
                    "task failed, credit refunded: user_id={} task_id={:?} reason={}",
                    user_id, task_id, reason
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30 * 60);

    fn lifecycle_with_credits(user_id: i64, credits: i64) -> TaskLifecycle {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(user_id, Some("tester")).unwrap();
        if credits > 0 {
            store.credit(user_id, credits).unwrap();
        }
        TaskLifecycle::new(store, TIMEOUT)
    }

    fn ok_ack() -> SubmitAck {
        SubmitAck {
            queue_num: 3,
            queue_time: 20,
            api_balance: 100.0,
        }
    }

    #[tokio::test]
    async fn start_without_credits_has_no_side_effects() {
        let lifecycle = lifecycle_with_credits(1, 0);
        let err = lifecycle
            .start_task(1, 1_000, |_| async { Ok(ok_ack()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCredits));
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 0);
        assert!(matches!(
            lifecycle.check_active(1, 1_000).unwrap(),
            TaskState::Idle
        ));
    }

    #[tokio::test]
    async fn successful_start_debits_and_records_the_task() {
        let lifecycle = lifecycle_with_credits(1, 1);
        let started = lifecycle
            .start_task(1, 1_000, |_| async { Ok(ok_ack()) })
            .await
            .unwrap();
        assert_eq!(started.task_id, "user_1_1000");
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 0);
        assert!(matches!(
            lifecycle.check_active(1, 1_000).unwrap(),
            TaskState::Pending { .. }
        ));
    }

    #[tokio::test]
    async fn second_start_reports_active_task_without_double_debit() {
        let lifecycle = lifecycle_with_credits(1, 2);
        lifecycle
            .start_task(1, 1_000, |_| async { Ok(ok_ack()) })
            .await
            .unwrap();

        let err = lifecycle
            .start_task(1, 1_060, |_| async { Ok(ok_ack()) })
            .await
            .unwrap_err();
        match err {
            LedgerError::TaskAlreadyActive { remaining_minutes } => {
                assert!(remaining_minutes > 0 && remaining_minutes <= 30);
            }
            other => panic!("expected TaskAlreadyActive, got {other:?}"),
        }
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn submission_failure_nets_the_balance_to_zero_change() {
        let lifecycle = lifecycle_with_credits(1, 1);
        let err = lifecycle
            .start_task(1, 1_000, |_| async {
                Err(GatewayError::Unavailable("request failed".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VendorUnavailable(_)));
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 1);
        assert!(matches!(
            lifecycle.check_active(1, 1_000).unwrap(),
            TaskState::Idle
        ));
    }

    #[tokio::test]
    async fn vendor_quota_exhaustion_preserves_the_credit() {
        let lifecycle = lifecycle_with_credits(1, 1);
        let err = lifecycle
            .start_task(1, 1_000, |_| async { Err(GatewayError::QuotaExhausted) })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VendorQuotaExhausted));
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn failure_outcome_refunds_and_duplicates_are_no_ops() {
        let lifecycle = lifecycle_with_credits(1, 1);
        let started = lifecycle
            .start_task(1, 1_000, |_| async { Ok(ok_ack()) })
            .await
            .unwrap();
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 0);

        let outcome = TaskOutcome::Failure("Age is too young".to_string());
        lifecycle
            .complete_task(1, Some(&started.task_id), &outcome)
            .unwrap();
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 1);

        // the vendor retries the same callback
        let err = lifecycle
            .complete_task(1, Some(&started.task_id), &outcome)
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownTask));
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn success_outcome_consumes_the_credit() {
        let lifecycle = lifecycle_with_credits(1, 1);
        let started = lifecycle
            .start_task(1, 1_000, |_| async { Ok(ok_ack()) })
            .await
            .unwrap();

        lifecycle
            .complete_task(1, Some(&started.task_id), &TaskOutcome::Success)
            .unwrap();
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 0);
        assert!(matches!(
            lifecycle.check_active(1, 2_000).unwrap(),
            TaskState::Idle
        ));
    }

    #[tokio::test]
    async fn unknown_task_for_user_without_active_task() {
        let lifecycle = lifecycle_with_credits(1, 1);
        let err = lifecycle
            .complete_task(1, Some("user_1_999"), &TaskOutcome::Success)
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownTask));
    }

    #[tokio::test]
    async fn check_active_reclaims_past_the_deadline() {
        let lifecycle = lifecycle_with_credits(1, 1);
        lifecycle
            .start_task(1, 1_000, |_| async { Ok(ok_ack()) })
            .await
            .unwrap();

        // 31 minutes later the pending task reads as Idle and the credit is back
        let later = 1_000 + 31 * 60;
        assert!(matches!(
            lifecycle.check_active(1, later).unwrap(),
            TaskState::Idle
        ));
        assert_eq!(lifecycle.store.get_balance(1).unwrap(), 1);

        // and a fresh start goes through
        lifecycle
            .start_task(1, later, |_| async { Ok(ok_ack()) })
            .await
            .unwrap();
    }
}
