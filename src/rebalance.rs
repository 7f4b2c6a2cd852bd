//! Auto-rebalance: periodically swaps accumulated stablecoin back into
//! native gas funds for the primary relayer wallet.
//!
//! Runs every five minutes behind a single in-progress flag; an overlapping
//! tick is skipped, never queued. The swap goes through a configured
//! V2-style router with a 5% slippage floor and a five-minute deadline. The
//! loop is a boundary concern: it stays disabled unless the router and
//! wrapped-native addresses are configured.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, Bytes, U256};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::SolCall;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::contracts::{IStablecoin, ISwapRouter};
use crate::chain::{ChainAdapter, ChainError};
use crate::config::Config;
use crate::pricing::{PriceOracle, usd_to_base_units};

pub const REBALANCE_INTERVAL_SECS: u64 = 300;

/// Native balance below which the primary wallet is topped up, whole units.
pub const NATIVE_THRESHOLD_UNITS: f64 = 10.0;

/// Minimum stablecoin balance (whole units) worth swapping.
const MIN_STABLE_UNITS: f64 = 1.0;

const SLIPPAGE_FLOOR: f64 = 0.95;
const SWAP_DEADLINE_SECS: u64 = 300;

/// Published state for `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceStatus {
    pub enabled: bool,
    pub in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<String>,
}

#[derive(Debug)]
pub struct AutoRebalancer {
    adapter: Arc<ChainAdapter>,
    oracle: Arc<PriceOracle>,
    primary: Address,
    router: Address,
    wrapped_native: Address,
    target_native: f64,
    stablecoin_decimals: u8,
    in_progress: AtomicBool,
    last_run_millis: AtomicU64,
    last_outcome: Mutex<Option<String>>,
}

impl AutoRebalancer {
    /// Builds the rebalancer when the swap route is configured; `None`
    /// leaves the loop disabled.
    pub fn from_config(
        config: &Config,
        adapter: Arc<ChainAdapter>,
        oracle: Arc<PriceOracle>,
        primary: Address,
    ) -> Option<Arc<Self>> {
        let router = config.swap_router_address?;
        let wrapped_native = config.wrapped_native_address?;
        Some(Arc::new(Self {
            adapter,
            oracle,
            primary,
            router,
            wrapped_native,
            target_native: config.rebalance_target_native,
            stablecoin_decimals: config.stablecoin_decimals,
            in_progress: AtomicBool::new(false),
            last_run_millis: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }))
    }

    pub fn status(&self) -> RebalanceStatus {
        let last_run = self.last_run_millis.load(Ordering::Acquire);
        RebalanceStatus {
            enabled: true,
            in_progress: self.in_progress.load(Ordering::Acquire),
            last_run_millis: (last_run > 0).then_some(last_run),
            last_outcome: self.last_outcome.lock().expect("outcome lock").clone(),
        }
    }

    /// Stablecoin amount to swap, in whole units: enough to reach the
    /// target with a 10% buffer, never more than half the stablecoin
    /// balance.
    pub fn swap_amount_stable(
        current_native: f64,
        target_native: f64,
        native_usd: f64,
        stable_balance: f64,
    ) -> f64 {
        let needed = (target_native - current_native) * native_usd * 1.1;
        needed.min(stable_balance * 0.5).max(0.0)
    }

    pub fn spawn(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let rebalancer = Arc::clone(self);
        tracker.spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(REBALANCE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => rebalancer.tick().await,
                }
            }
            tracing::debug!("auto-rebalance task stopped");
        });
    }

    async fn tick(&self) {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("rebalance still running, skipping tick");
            return;
        }

        let outcome = match self.rebalance_once().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "rebalance failed");
                format!("failed: {e}")
            }
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_run_millis.store(now, Ordering::Release);
        *self.last_outcome.lock().expect("outcome lock") = Some(outcome);
        self.in_progress.store(false, Ordering::Release);
    }

    async fn rebalance_once(&self) -> Result<String, ChainError> {
        let native_wei = self.adapter.native_balance(self.primary).await?;
        let native_units = wei_to_units(native_wei);
        if native_units >= NATIVE_THRESHOLD_UNITS {
            return Ok(format!("balanced: {native_units:.4} native"));
        }

        let stable_raw = self.adapter.stablecoin_balance(self.primary).await?;
        let stable_units = raw_to_units(stable_raw, self.stablecoin_decimals);
        if stable_units < MIN_STABLE_UNITS {
            return Ok(format!(
                "skipped: only {stable_units:.2} stablecoin available"
            ));
        }

        let native_usd = self.oracle.spot();
        let amount_units = Self::swap_amount_stable(
            native_units,
            self.target_native,
            native_usd,
            stable_units,
        );
        if amount_units <= 0.0 {
            return Ok("skipped: nothing to swap".to_string());
        }
        let (_, amount_raw) = usd_to_base_units(amount_units, self.stablecoin_decimals);

        self.ensure_allowance(amount_raw).await?;

        // Expected native output at spot, floored 5% for slippage.
        let expected_native = amount_units / native_usd;
        let min_out_wei = units_to_wei(expected_native * SLIPPAGE_FLOOR);

        let deadline = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + SWAP_DEADLINE_SECS;

        let calldata = ISwapRouter::swapExactTokensForETHCall {
            amountIn: amount_raw,
            amountOutMin: min_out_wei,
            path: vec![self.adapter.stablecoin(), self.wrapped_native],
            to: self.primary,
            deadline: U256::from(deadline),
        }
        .abi_encode();

        let tx = TransactionRequest::default()
            .with_from(self.primary)
            .with_to(self.router)
            .with_input(Bytes::from(calldata));
        let receipt = self.adapter.send(tx).await?;
        if !receipt.status() {
            return Ok(format!("swap reverted: {}", receipt.transaction_hash));
        }

        tracing::info!(
            tx = %receipt.transaction_hash,
            amount = amount_units,
            "rebalanced stablecoin into native"
        );
        Ok(format!(
            "swapped {amount_units:.2} stablecoin, tx {}",
            receipt.transaction_hash
        ))
    }

    async fn ensure_allowance(&self, amount: U256) -> Result<(), ChainError> {
        let calldata = IStablecoin::allowanceCall {
            owner: self.primary,
            spender: self.router,
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .with_to(self.adapter.stablecoin())
            .with_input(Bytes::from(calldata));
        let returned = self.adapter.call(tx).await?;
        let allowance = IStablecoin::allowanceCall::abi_decode_returns(&returned)
            .map_err(|e| ChainError::classify(e))?;
        if allowance >= amount {
            return Ok(());
        }

        let approve = IStablecoin::approveCall {
            spender: self.router,
            amount: U256::MAX,
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .with_from(self.primary)
            .with_to(self.adapter.stablecoin())
            .with_input(Bytes::from(approve));
        let receipt = self.adapter.send(tx).await?;
        tracing::info!(tx = %receipt.transaction_hash, "approved swap router");
        Ok(())
    }
}

fn wei_to_units(wei: U256) -> f64 {
    wei.to_string().parse::<f64>().unwrap_or(f64::MAX) / 1e18
}

fn raw_to_units(raw: U256, decimals: u8) -> f64 {
    raw.to_string().parse::<f64>().unwrap_or(f64::MAX) / 10f64.powi(decimals as i32)
}

fn units_to_wei(units: f64) -> U256 {
    // Mirror the microdollar conversion: format with fixed precision, then
    // scale. 6 fractional digits of a native unit is ample for a floor.
    let (_, micro) = usd_to_base_units(units, 6);
    micro * U256::from(10u64).pow(U256::from(12u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_amount_targets_shortfall_with_buffer() {
        // 2 native held, 50 target, $0.15 spot: needs 48 * 0.15 * 1.1 = 7.92
        // stablecoin, well under half of a 100 balance.
        let amount = AutoRebalancer::swap_amount_stable(2.0, 50.0, 0.15, 100.0);
        assert!((amount - 7.92).abs() < 1e-9);
    }

    #[test]
    fn swap_amount_caps_at_half_the_stablecoin() {
        let amount = AutoRebalancer::swap_amount_stable(0.0, 1000.0, 1.0, 10.0);
        assert_eq!(amount, 5.0);
    }

    #[test]
    fn swap_amount_never_negative() {
        let amount = AutoRebalancer::swap_amount_stable(100.0, 50.0, 0.15, 10.0);
        assert_eq!(amount, 0.0);
    }

    #[test]
    fn unit_conversions_roundtrip() {
        assert_eq!(wei_to_units(U256::from(10u64).pow(U256::from(18u64))), 1.0);
        assert_eq!(
            units_to_wei(1.5),
            U256::from(15u64) * U256::from(10u64).pow(U256::from(17u64))
        );
    }
}
