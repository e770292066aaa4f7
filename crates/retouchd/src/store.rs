use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use retouch_core::config::DatabaseConfig;

const INIT_SQL: &str = include_str!("../../../migrations/001_init.sql");

/// Handle on the ledger store. Every balance/task/referral mutation goes
/// through here; the invariant-bearing writes are single conditional UPDATE
/// statements whose affected-row count tells the caller whether it won.
#[derive(Clone)]
pub(crate) struct Store {
    db: Arc<Mutex<Connection>>,
}

#[derive(Debug)]
pub(crate) struct PendingTask {
    pub task_id: String,
    pub started_at: i64,
}

#[derive(Debug)]
pub(crate) struct ReclaimedTask {
    pub user_id: i64,
    pub task_id: String,
    pub age_seconds: i64,
}

impl Store {
    pub(crate) fn open(config: &DatabaseConfig) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(&config.sqlite_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(&config.sqlite_path)?;
        db.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        db.execute_batch(INIT_SQL)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> anyhow::Result<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(INIT_SQL)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| anyhow::anyhow!("db lock poisoned"))
    }

    pub(crate) fn ensure_user(&self, user_id: i64, username: Option<&str>) -> anyhow::Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO users (user_id, username, credits, created_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(user_id) DO NOTHING",
            params![user_id, username.unwrap_or("anonymous"), crate::now_ts()],
        )?;
        Ok(())
    }

    pub(crate) fn user_exists(&self, user_id: i64) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT 1 FROM users WHERE user_id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Unknown users read as zero balance, not as an error.
    pub(crate) fn get_balance(&self, user_id: i64) -> anyhow::Result<i64> {
        let db = self.conn()?;
        let credits = db
            .query_row(
                "SELECT credits FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(credits.unwrap_or(0))
    }

    /// Balance check and decrement in one statement; of N concurrent callers
    /// against a balance of 1, exactly one sees a changed row.
    pub(crate) fn debit_one(&self, user_id: i64, now: i64) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE users
             SET credits = credits - 1, last_used = ?2
             WHERE user_id = ?1 AND credits > 0",
            params![user_id, now],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn credit(&self, user_id: i64, amount: i64) -> anyhow::Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE users SET credits = credits + ?2 WHERE user_id = ?1",
            params![user_id, amount],
        )?;
        Ok(())
    }

    pub(crate) fn update_pending_task(
        &self,
        user_id: i64,
        task_id: &str,
        now: i64,
    ) -> anyhow::Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE users SET pending_task_id = ?2, last_used = ?3 WHERE user_id = ?1",
            params![user_id, task_id, now],
        )?;
        Ok(())
    }

    pub(crate) fn pending_task(&self, user_id: i64) -> anyhow::Result<Option<PendingTask>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT pending_task_id, last_used FROM users
                 WHERE user_id = ?1 AND pending_task_id IS NOT NULL",
                params![user_id],
                |row| {
                    Ok(PendingTask {
                        task_id: row.get(0)?,
                        started_at: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Webhook success: clear the task, keep the credit spent. When the
    /// callback carried a task id only that task settles; otherwise the sole
    /// active task does. Zero rows changed means a late or duplicate callback.
    pub(crate) fn settle_success(
        &self,
        user_id: i64,
        task_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let changed = match task_id {
            Some(tid) => db.execute(
                "UPDATE users SET pending_task_id = NULL, last_used = NULL
                 WHERE user_id = ?1 AND pending_task_id = ?2",
                params![user_id, tid],
            )?,
            None => db.execute(
                "UPDATE users SET pending_task_id = NULL, last_used = NULL
                 WHERE user_id = ?1 AND pending_task_id IS NOT NULL",
                params![user_id],
            )?,
        };
        Ok(changed == 1)
    }

    /// Webhook failure: clear the task and refund the credit in one statement,
    /// so a racing sweeper cannot refund the same task twice.
    pub(crate) fn settle_failure(
        &self,
        user_id: i64,
        task_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let changed = match task_id {
            Some(tid) => db.execute(
                "UPDATE users
                 SET credits = credits + 1, pending_task_id = NULL, last_used = NULL
                 WHERE user_id = ?1 AND pending_task_id = ?2",
                params![user_id, tid],
            )?,
            None => db.execute(
                "UPDATE users
                 SET credits = credits + 1, pending_task_id = NULL, last_used = NULL
                 WHERE user_id = ?1 AND pending_task_id IS NOT NULL",
                params![user_id],
            )?,
        };
        Ok(changed == 1)
    }

    /// Single-user variant of [`Store::reclaim_stale`], used by the inline
    /// timeout check so no caller ever observes a pending task past its
    /// deadline.
    pub(crate) fn reclaim_if_stale(&self, user_id: i64, cutoff: i64) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE users
             SET credits = credits + 1, pending_task_id = NULL, last_used = NULL
             WHERE user_id = ?1 AND pending_task_id IS NOT NULL
               AND last_used IS NOT NULL AND last_used <= ?2",
            params![user_id, cutoff],
        )?;
        Ok(changed == 1)
    }

    /// Refund and clear every task older than the timeout. Candidates are read
    /// first, then each is settled by a conditional update; a concurrent
    /// webhook that settles the same task first makes the update a no-op, so
    /// the loser performs no redundant refund.
    pub(crate) fn reclaim_stale(
        &self,
        now: i64,
        timeout: Duration,
    ) -> anyhow::Result<Vec<ReclaimedTask>> {
        let cutoff = now - timeout.as_secs() as i64;
        let db = self.conn()?;

        let mut stmt = db.prepare(
            "SELECT user_id, pending_task_id, last_used FROM users
             WHERE pending_task_id IS NOT NULL AND last_used IS NOT NULL AND last_used <= ?1",
        )?;
        let candidates = stmt
            .query_map(params![cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut reclaimed = Vec::new();
        for (user_id, task_id, last_used) in candidates {
            let changed = db.execute(
                "UPDATE users
                 SET credits = credits + 1, pending_task_id = NULL, last_used = NULL
                 WHERE user_id = ?1 AND pending_task_id = ?2 AND last_used <= ?3",
                params![user_id, task_id, cutoff],
            )?;
            if changed == 0 {
                debug!(
                    "reclaim race lost: user_id={} task_id={}, settled by a callback first",
                    user_id, task_id
                );
                continue;
            }
            reclaimed.push(ReclaimedTask {
                user_id,
                task_id,
                age_seconds: now - last_used,
            });
        }

        Ok(reclaimed)
    }

    pub(crate) fn referrer_of(&self, user_id: i64) -> anyhow::Result<Option<i64>> {
        let db = self.conn()?;
        let referrer = db
            .query_row(
                "SELECT referrer_id FROM users
                 WHERE user_id = ?1 AND referrer_id IS NOT NULL",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(referrer)
    }

    /// Set-once: the conditional guard makes a concurrent double-link resolve
    /// to a single winner.
    pub(crate) fn set_referrer(&self, user_id: i64, referrer_id: i64) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE users SET referrer_id = ?2
             WHERE user_id = ?1 AND referrer_id IS NULL",
            params![user_id, referrer_id],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn increment_total_referrals(&self, referrer_id: i64) -> anyhow::Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE users SET total_referrals = total_referrals + 1 WHERE user_id = ?1",
            params![referrer_id],
        )?;
        Ok(())
    }

    pub(crate) fn add_referral_earnings(&self, referrer_id: i64, bonus: f64) -> anyhow::Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE users SET referral_earnings = referral_earnings + ?2 WHERE user_id = ?1",
            params![referrer_id, bonus],
        )?;
        Ok(())
    }

    pub(crate) fn referral_stats(&self, user_id: i64) -> anyhow::Result<(i64, f64)> {
        let db = self.conn()?;
        let stats = db
            .query_row(
                "SELECT total_referrals, referral_earnings FROM users WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        Ok(stats.unwrap_or((0, 0.0)))
    }

    /// Insert-if-absent on the UNIQUE payment id; false means this
    /// confirmation was already processed and must not grant again.
    pub(crate) fn record_payment(
        &self,
        user_id: i64,
        payment_id: &str,
        amount: f64,
        credits: i64,
    ) -> anyhow::Result<bool> {
        let db = self.conn()?;
        let changed = db.execute(
            "INSERT INTO payments (user_id, payment_id, amount, credits, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'completed', ?5)
             ON CONFLICT(payment_id) DO NOTHING",
            params![user_id, payment_id, amount, credits, crate::now_ts()],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn count_users(&self) -> anyhow::Result<i64> {
        let db = self.conn()?;
        let n = db.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(n)
    }

    pub(crate) fn count_pending_tasks(&self) -> anyhow::Result<i64> {
        let db = self.conn()?;
        let n = db.query_row(
            "SELECT COUNT(*) FROM users WHERE pending_task_id IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user(user_id: i64, credits: i64) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(user_id, Some("tester")).unwrap();
        if credits > 0 {
            store.credit(user_id, credits).unwrap();
        }
        store
    }

    #[test]
    fn unknown_user_reads_as_zero_balance() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_balance(42).unwrap(), 0);
        assert!(!store.user_exists(42).unwrap());
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let store = store_with_user(1, 3);
        store.ensure_user(1, Some("second-call")).unwrap();
        assert_eq!(store.get_balance(1).unwrap(), 3);
    }

    #[test]
    fn debit_one_never_goes_negative() {
        let store = store_with_user(1, 2);
        assert!(store.debit_one(1, 100).unwrap());
        assert!(store.debit_one(1, 101).unwrap());
        assert!(!store.debit_one(1, 102).unwrap());
        assert_eq!(store.get_balance(1).unwrap(), 0);
    }

    #[test]
    fn debit_one_against_balance_one_succeeds_once() {
        let store = store_with_user(1, 1);
        let outcomes: Vec<bool> = (0..5).map(|i| store.debit_one(1, i).unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(store.get_balance(1).unwrap(), 0);
    }

    #[test]
    fn settle_failure_refunds_exactly_once() {
        let store = store_with_user(1, 1);
        assert!(store.debit_one(1, 100).unwrap());
        store.update_pending_task(1, "user_1_100", 100).unwrap();

        assert!(store.settle_failure(1, Some("user_1_100")).unwrap());
        assert_eq!(store.get_balance(1).unwrap(), 1);
        assert!(store.pending_task(1).unwrap().is_none());

        // duplicate delivery of the same failure callback
        assert!(!store.settle_failure(1, Some("user_1_100")).unwrap());
        assert_eq!(store.get_balance(1).unwrap(), 1);
    }

    #[test]
    fn settle_success_keeps_the_credit_spent() {
        let store = store_with_user(1, 1);
        assert!(store.debit_one(1, 100).unwrap());
        store.update_pending_task(1, "user_1_100", 100).unwrap();

        assert!(store.settle_success(1, Some("user_1_100")).unwrap());
        assert_eq!(store.get_balance(1).unwrap(), 0);
        assert!(store.pending_task(1).unwrap().is_none());
    }

    #[test]
    fn settle_with_mismatched_task_id_is_a_no_op() {
        let store = store_with_user(1, 1);
        assert!(store.debit_one(1, 100).unwrap());
        store.update_pending_task(1, "user_1_100", 100).unwrap();

        assert!(!store.settle_failure(1, Some("user_1_999")).unwrap());
        assert_eq!(store.get_balance(1).unwrap(), 0);
        assert!(store.pending_task(1).unwrap().is_some());
    }

    #[test]
    fn settle_without_task_id_targets_the_sole_active_task() {
        let store = store_with_user(1, 1);
        assert!(store.debit_one(1, 100).unwrap());
        store.update_pending_task(1, "user_1_100", 100).unwrap();

        assert!(store.settle_success(1, None).unwrap());
        assert!(!store.settle_success(1, None).unwrap());
    }

    #[test]
    fn reclaim_stale_refunds_old_tasks_only() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1, None).unwrap();
        store.ensure_user(2, None).unwrap();
        store.credit(1, 1).unwrap();
        store.credit(2, 1).unwrap();

        let now = 10_000;
        // user 1: stale (started 31 minutes ago), user 2: fresh
        store.debit_one(1, now - 31 * 60).unwrap();
        store.update_pending_task(1, "user_1_old", now - 31 * 60).unwrap();
        store.debit_one(2, now - 60).unwrap();
        store.update_pending_task(2, "user_2_new", now - 60).unwrap();

        let reclaimed = store
            .reclaim_stale(now, Duration::from_secs(30 * 60))
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].user_id, 1);
        assert_eq!(reclaimed[0].age_seconds, 31 * 60);
        assert_eq!(store.get_balance(1).unwrap(), 1);
        assert!(store.pending_task(1).unwrap().is_none());
        assert_eq!(store.get_balance(2).unwrap(), 0);
        assert!(store.pending_task(2).unwrap().is_some());

        // a second sweep finds nothing left to reclaim
        let again = store
            .reclaim_stale(now, Duration::from_secs(30 * 60))
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(store.get_balance(1).unwrap(), 1);
    }

    #[test]
    fn reclaim_with_zero_timeout_takes_everything_outstanding() {
        let store = store_with_user(1, 1);
        store.debit_one(1, 500).unwrap();
        store.update_pending_task(1, "user_1_500", 500).unwrap();

        let reclaimed = store.reclaim_stale(500, Duration::ZERO).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(store.get_balance(1).unwrap(), 1);
    }

    #[test]
    fn reclaim_if_stale_honors_the_cutoff() {
        let store = store_with_user(1, 1);
        store.debit_one(1, 1_000).unwrap();
        store.update_pending_task(1, "user_1_1000", 1_000).unwrap();

        assert!(!store.reclaim_if_stale(1, 999).unwrap());
        assert!(store.reclaim_if_stale(1, 1_000).unwrap());
        assert_eq!(store.get_balance(1).unwrap(), 1);
        // already reclaimed, nothing further to refund
        assert!(!store.reclaim_if_stale(1, 1_000).unwrap());
    }

    #[test]
    fn set_referrer_is_set_once() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1, None).unwrap();
        store.ensure_user(2, None).unwrap();
        store.ensure_user(3, None).unwrap();

        assert!(store.set_referrer(1, 2).unwrap());
        assert!(!store.set_referrer(1, 3).unwrap());
        assert_eq!(store.referrer_of(1).unwrap(), Some(2));
    }

    #[test]
    fn record_payment_rejects_duplicates() {
        let store = store_with_user(1, 0);
        assert!(store.record_payment(1, "pay-1", 500.0, 4).unwrap());
        assert!(!store.record_payment(1, "pay-1", 500.0, 4).unwrap());
        assert!(store.record_payment(1, "pay-2", 700.0, 8).unwrap());
    }
}
