use courier_primitives::consts::gateway::GAS_ESTIMATE_WINDOW;
use ethers::types::U256;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Rolling window of recent successful gas estimates, used as the fallback
/// when simulation fails for a transaction we still want to send.
#[derive(Debug, Default)]
pub struct GasEstimateRing {
    estimates: Mutex<VecDeque<u64>>,
}

impl GasEstimateRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful estimate, keeping only the most recent window.
    pub fn track(&self, gas_limit: u64) {
        let mut estimates = self.estimates.lock();
        estimates.push_back(gas_limit);
        while estimates.len() > GAS_ESTIMATE_WINDOW {
            estimates.pop_front();
        }
    }

    /// Average of the window; `None` until at least one estimate landed.
    pub fn average(&self) -> Option<u64> {
        let estimates = self.estimates.lock();
        if estimates.is_empty() {
            return None;
        }
        Some(estimates.iter().sum::<u64>() / estimates.len() as u64)
    }
}

/// Derive `(max_fee_per_gas, max_priority_fee_per_gas)` from recent-block
/// fee history.
///
/// The priority fee is the average of the sampled percentile rewards plus a
/// 20% buffer for faster inclusion; with no reward data the node's
/// `eth_maxPriorityFeePerGas` hint stands in. The max fee adds 25% of the
/// base fee to absorb one or two blocks of fluctuation.
pub fn compute_fee_estimates(
    latest_base_fee: U256,
    rewards: &[U256],
    priority_hint: Option<U256>,
) -> eyre::Result<(U256, U256)> {
    let avg_priority = if rewards.is_empty() {
        priority_hint.ok_or_else(|| eyre::eyre!("no reward data and no priority fee hint"))?
    } else {
        rewards.iter().fold(U256::zero(), |acc, r| acc + r) / U256::from(rewards.len())
    };

    let max_priority_fee = avg_priority + avg_priority / 5;
    let max_fee = latest_base_fee + latest_base_fee / 4 + max_priority_fee;

    Ok((max_fee, max_priority_fee))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_only_the_recent_window() {
        let ring = GasEstimateRing::new();
        assert_eq!(ring.average(), None);

        for gas in [100, 200, 300, 400, 500, 600] {
            ring.track(gas);
        }

        // The first estimate fell out of the 5-slot window.
        assert_eq!(ring.average(), Some((200 + 300 + 400 + 500 + 600) / 5));
    }

    #[test]
    fn priority_fee_is_buffered_average() {
        let rewards = [U256::from(100u64), U256::from(200u64), U256::from(300u64)];

        let (max_fee, priority) =
            compute_fee_estimates(U256::from(1_000u64), &rewards, None).unwrap();

        // avg 200 + 20% = 240; base 1000 + 25% + priority
        assert_eq!(priority, U256::from(240u64));
        assert_eq!(max_fee, U256::from(1_000u64 + 250 + 240));
    }

    #[test]
    fn falls_back_to_the_node_hint_without_rewards() {
        let (max_fee, priority) =
            compute_fee_estimates(U256::from(1_000u64), &[], Some(U256::from(50u64))).unwrap();

        assert_eq!(priority, U256::from(60u64));
        assert_eq!(max_fee, U256::from(1_000u64 + 250 + 60));

        assert!(compute_fee_estimates(U256::from(1_000u64), &[], None).is_err());
    }
}
