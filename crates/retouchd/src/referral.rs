use tracing::info;

use retouch_core::error::LedgerError;

use crate::store::Store;

/// Referral edges are one-time and immutable: a user picks a referrer at most
/// once, the link never changes, and the graph must stay acyclic.
#[derive(Clone)]
pub(crate) struct ReferralLedger {
    store: Store,
    bonus_rate: f64,
    max_chain_depth: usize,
}

impl ReferralLedger {
    pub(crate) fn new(store: Store, bonus_rate: f64, max_chain_depth: usize) -> Self {
        Self {
            store,
            bonus_rate,
            max_chain_depth: max_chain_depth.max(1),
        }
    }

    pub(crate) fn link_referral(&self, user_id: i64, referrer_id: i64) -> Result<(), LedgerError> {
        if user_id == referrer_id {
            return Err(LedgerError::SelfReferral);
        }
        if !self
            .store
            .user_exists(referrer_id)
            .map_err(LedgerError::storage)?
        {
            return Err(LedgerError::ReferrerNotFound);
        }
        if self
            .store
            .referrer_of(user_id)
            .map_err(LedgerError::storage)?
            .is_some()
        {
            return Err(LedgerError::AlreadyLinked);
        }

        // Walk upward from the proposed referrer; reaching user_id means the
        // new edge would close a loop. Depth is bounded to cap the cost.
        let mut current = referrer_id;
        for _ in 0..self.max_chain_depth {
            match self
                .store
                .referrer_of(current)
                .map_err(LedgerError::storage)?
            {
                Some(next) if next == user_id => return Err(LedgerError::CyclicReferral),
                Some(next) => current = next,
                None => break,
            }
        }

        if !self
            .store
            .set_referrer(user_id, referrer_id)
            .map_err(LedgerError::storage)?
        {
            // lost a race against a concurrent link for the same user
            return Err(LedgerError::AlreadyLinked);
        }
        self.store
            .increment_total_referrals(referrer_id)
            .map_err(LedgerError::storage)?;

        info!(
            "referral linked: user_id={} referrer_id={}",
            user_id, referrer_id
        );
        Ok(())
    }

    /// Credit the referrer's earnings for a completed purchase. Returns the
    /// referrer and the bonus so the caller can notify them, or `None` when
    /// the payer has no referrer. The caller guards the once-per-payment
    /// contract via the payments table.
    pub(crate) fn apply_purchase_bonus(
        &self,
        user_id: i64,
        payment_amount: f64,
    ) -> Result<Option<(i64, f64)>, LedgerError> {
        let Some(referrer_id) = self
            .store
            .referrer_of(user_id)
            .map_err(LedgerError::storage)?
        else {
            return Ok(None);
        };

        let bonus = payment_amount * self.bonus_rate;
        self.store
            .add_referral_earnings(referrer_id, bonus)
            .map_err(LedgerError::storage)?;
        info!(
            "referral bonus applied: user_id={} referrer_id={} bonus={:.2}",
            user_id, referrer_id, bonus
        );
        Ok(Some((referrer_id, bonus)))
    }

    pub(crate) fn stats(&self, user_id: i64) -> Result<(i64, f64), LedgerError> {
        self.store
            .referral_stats(user_id)
            .map_err(LedgerError::storage)
    }
}
