use courier_gateway::ChainClient;
use courier_primitives::consts::reconciler::{TICK_SECS, TIMEOUT_AGE_MINUTES};
use courier_store::{Store, UserOpStatus};
use ethers::types::H256;
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Terminal state for a timed-out operation given what the chain reports.
///
/// * never sent (no tx hash) → reverted
/// * receipt found → success (the bundle was mined after all)
/// * no receipt → reverted
pub fn resolve_timeout(has_tx_hash: bool, receipt_found: bool) -> UserOpStatus {
    if !has_tx_hash {
        return UserOpStatus::Reverted;
    }

    if receipt_found {
        UserOpStatus::Success
    } else {
        UserOpStatus::Reverted
    }
}

/// Periodic sweep of stuck user operations against chain state.
pub struct TimeoutReconciler {
    store: Store,
    chain: Arc<dyn ChainClient>,
}

impl TimeoutReconciler {
    pub fn new(store: Store, chain: Arc<dyn ChainClient>) -> Self {
        Self { store, chain }
    }

    /// Run the reconciler: once immediately, then on every tick until
    /// cancellation. Sweep errors are logged and retried next tick.
    pub async fn start(&self, cancel: CancellationToken) -> eyre::Result<()> {
        info!("starting timeout reconciler");

        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECS));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopping timeout reconciler");
                    return Ok(());
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        // Pending operations whose validity window closed can never be
        // bundled anymore.
        match self.store.userops.expired_pending().await {
            Ok(expired) if !expired.is_empty() => {
                info!(count = expired.len(), "expiring pending userops")
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "error fetching expired userops"),
        }
        if let Err(err) = self.store.userops.mark_expired_reverted().await {
            error!(error = %err, "error expiring pending userops");
        }

        let ops = match self.store.userops.timeout_older_than(TIMEOUT_AGE_MINUTES).await {
            Ok(ops) => ops,
            Err(err) => {
                error!(error = %err, "error fetching timeout userops");
                return;
            }
        };

        if ops.is_empty() {
            return;
        }

        info!(count = ops.len(), "checking timeout userops for receipts");

        for op in ops {
            let receipt_found = match &op.tx_hash {
                None => false,
                Some(tx_hash) => match self.check_receipt(tx_hash).await {
                    Ok(found) => found,
                    Err(err) => {
                        // Chain hiccup: leave the op for the next sweep.
                        warn!(tx_hash, error = %err, "error checking receipt");
                        continue;
                    }
                },
            };

            let status = resolve_timeout(op.tx_hash.is_some(), receipt_found);

            match self.store.userops.update_status(&op.user_op_hash, status).await {
                Ok(()) => info!(user_op = %op.user_op_hash, %status, "reconciled timeout userop"),
                Err(err) => {
                    error!(user_op = %op.user_op_hash, error = %err, "error updating userop")
                }
            }
        }
    }

    async fn check_receipt(&self, tx_hash: &str) -> eyre::Result<bool> {
        let hash = H256::from_str(tx_hash)?;
        let receipt = self.chain.transaction_receipt(hash).await?;
        Ok(receipt.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_sent_operations_revert() {
        assert_eq!(resolve_timeout(false, false), UserOpStatus::Reverted);
        // A receipt without a tx hash cannot happen; the tx hash decides.
        assert_eq!(resolve_timeout(false, true), UserOpStatus::Reverted);
    }

    #[test]
    fn mined_operations_succeed() {
        assert_eq!(resolve_timeout(true, true), UserOpStatus::Success);
    }

    #[test]
    fn unmined_operations_revert() {
        assert_eq!(resolve_timeout(true, false), UserOpStatus::Reverted);
    }

    #[test]
    fn reconciler_outcomes_are_legal_transitions() {
        for (has_tx, found) in [(false, false), (true, true), (true, false)] {
            let status = resolve_timeout(has_tx, found);
            assert!(status.can_transition_from(UserOpStatus::Timeout));
        }
    }
}
