use std::time::Duration;

use tracing::{error, info, warn};

use crate::AppState;

pub(crate) fn spawn_sweeper(state: AppState) {
    tokio::spawn(async move {
        // A process restart changes the webhook identity, so every task left
        // over from the previous process is reclaimed immediately instead of
        // stranding its credit behind a callback that will never arrive.
        match sweep_once(&state, Duration::ZERO).await {
            Ok(n) if n > 0 => info!("startup sweep reclaimed {} stranded tasks", n),
            Ok(_) => {}
            Err(err) => error!("Startup sweep failed: {}", err),
        }

        let interval = Duration::from_secs(state.sweep_interval_seconds.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = sweep_once(&state, state.task_timeout).await {
                error!("Sweep tick failed: {}", err);
            }
        }
    });
}

/// One reclamation cycle. The ledger corrections commit first; notifications
/// are one attempt each, logged on failure, never retried.
async fn sweep_once(state: &AppState, timeout: Duration) -> anyhow::Result<usize> {
    let now = crate::now_ts_u64() as i64;
    let reclaimed = state.store.reclaim_stale(now, timeout)?;

    for task in &reclaimed {
        let minutes = task.age_seconds / 60;
        info!(
            "stale task reclaimed: user_id={} task_id={} age_minutes={}",
            task.user_id, task.task_id, minutes
        );
        let text = format!(
            "⏰ Your task did not finish within {minutes} minutes.\n\
             1 credit has been returned to your balance, you can start a new task."
        );
        if let Err(err) = state.notifier.send_text(task.user_id, &text).await {
            warn!(
                "sweep notify failed: user_id={} task_id={} err={}",
                task.user_id, task.task_id, err
            );
        }
    }

    Ok(reclaimed.len())
}
