//! Pool of funded gas wallets.
//!
//! Each relay job borrows one wallet for its lifetime. Selection is
//! least-busy by default (smallest in-flight count, ties broken by least
//! recent use) with a round-robin alternative for evenly distributing
//! identical load. The pool never serializes submissions on a wallet; nonce
//! correctness comes from the adapter's pending-aware nonce filler, and
//! [`RelayerPool::resync`] re-reads the chain after a nonce or fee failure.

use alloy_primitives::Address;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chain::{ChainAdapter, ChainError};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Book-keeping for one gas wallet. Owned exclusively by the pool; jobs see
/// it only through a [`RelayerGuard`].
#[derive(Debug)]
pub struct RelayerState {
    address: Address,
    /// Jobs dispatched minus jobs settled; never negative.
    pending_count: AtomicUsize,
    last_used_millis: AtomicU64,
    /// Seed value after a resync. Dispatch itself defers to the adapter's
    /// pending view; this exists for observability and post-resync seeding.
    nonce_hint: AtomicU64,
}

impl RelayerState {
    fn new(address: Address, nonce_hint: u64) -> Self {
        Self {
            address,
            pending_count: AtomicUsize::new(0),
            last_used_millis: AtomicU64::new(0),
            nonce_hint: AtomicU64::new(nonce_hint),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    fn release(&self) {
        // Saturating decrement: double releases must not underflow.
        let _ = self
            .pending_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Borrowed wallet handle, valid for one job. Releasing happens on drop so
/// every exit path of an execution decrements the in-flight count.
#[derive(Debug)]
pub struct RelayerGuard {
    state: Arc<RelayerState>,
}

impl RelayerGuard {
    pub fn address(&self) -> Address {
        self.state.address
    }
}

impl Drop for RelayerGuard {
    fn drop(&mut self) {
        self.state.release();
    }
}

/// Wallet selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    #[default]
    LeastBusy,
    RoundRobin,
}

/// Point-in-time view of one wallet, for `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayerSnapshot {
    pub address: Address,
    pub pending: usize,
    pub last_used_millis: u64,
    pub nonce_hint: u64,
}

/// Aggregated pool statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub relayers: usize,
    pub in_flight: usize,
    pub wallets: Vec<RelayerSnapshot>,
}

#[derive(Debug)]
pub struct RelayerPool {
    relayers: Vec<Arc<RelayerState>>,
    policy: SelectionPolicy,
    cursor: AtomicUsize,
}

impl RelayerPool {
    /// Initializes the pool from the adapter's signer set, recording each
    /// wallet's current pending nonce as its hint.
    pub async fn from_chain(
        adapter: &ChainAdapter,
        policy: SelectionPolicy,
    ) -> Result<Self, ChainError> {
        let mut relayers = Vec::with_capacity(adapter.signer_addresses().len());
        for &address in adapter.signer_addresses() {
            let nonce = adapter.pending_nonce(address).await?;
            tracing::info!(%address, nonce, "registered relayer wallet");
            relayers.push(Arc::new(RelayerState::new(address, nonce)));
        }
        Ok(Self {
            relayers,
            policy,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Pool over bare addresses with zeroed nonce hints.
    pub fn with_addresses(addresses: Vec<Address>, policy: SelectionPolicy) -> Self {
        let relayers = addresses
            .into_iter()
            .map(|address| Arc::new(RelayerState::new(address, 0)))
            .collect();
        Self {
            relayers,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Borrows a wallet for one job, bumping its in-flight count and
    /// last-used stamp.
    pub fn acquire(&self) -> RelayerGuard {
        debug_assert!(!self.relayers.is_empty());
        let state = match self.policy {
            SelectionPolicy::RoundRobin => {
                let next = self.cursor.fetch_add(1, Ordering::Relaxed) % self.relayers.len();
                Arc::clone(&self.relayers[next])
            }
            SelectionPolicy::LeastBusy => {
                let chosen = self
                    .relayers
                    .iter()
                    .min_by_key(|r| {
                        (
                            r.pending_count.load(Ordering::Acquire),
                            r.last_used_millis.load(Ordering::Acquire),
                        )
                    })
                    .expect("pool holds at least one relayer");
                Arc::clone(chosen)
            }
        };
        state.pending_count.fetch_add(1, Ordering::AcqRel);
        state.last_used_millis.store(now_millis(), Ordering::Release);
        RelayerGuard { state }
    }

    /// Re-reads a wallet's pending nonce after a `NonceTooLow` or
    /// `Underpriced` failure and drops the adapter's cached value so the
    /// next submission starts from the chain's view.
    pub async fn resync(
        &self,
        adapter: &ChainAdapter,
        address: Address,
    ) -> Result<u64, ChainError> {
        adapter.reset_nonce(address).await;
        let nonce = adapter.pending_nonce(address).await?;
        if let Some(state) = self.relayers.iter().find(|r| r.address == address) {
            state.nonce_hint.store(nonce, Ordering::Release);
        }
        tracing::info!(%address, nonce, "resynced relayer nonce");
        Ok(nonce)
    }

    /// Address of the primary wallet (first configured key).
    pub fn primary(&self) -> Address {
        self.relayers[0].address
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.relayers.iter().map(|r| r.address).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let wallets: Vec<RelayerSnapshot> = self
            .relayers
            .iter()
            .map(|r| RelayerSnapshot {
                address: r.address,
                pending: r.pending_count.load(Ordering::Acquire),
                last_used_millis: r.last_used_millis.load(Ordering::Acquire),
                nonce_hint: r.nonce_hint.load(Ordering::Acquire),
            })
            .collect();
        PoolStats {
            relayers: wallets.len(),
            in_flight: wallets.iter().map(|w| w.pending).sum(),
            wallets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn pool(policy: SelectionPolicy) -> RelayerPool {
        RelayerPool::with_addresses(
            vec![
                address!("1000000000000000000000000000000000000001"),
                address!("1000000000000000000000000000000000000002"),
                address!("1000000000000000000000000000000000000003"),
            ],
            policy,
        )
    }

    #[test]
    fn least_busy_spreads_concurrent_jobs() {
        let pool = pool(SelectionPolicy::LeastBusy);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        let mut picked = vec![a.address(), b.address(), c.address()];
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 3, "three concurrent jobs use three wallets");
    }

    #[test]
    fn least_busy_prefers_idle_wallet() {
        let pool = pool(SelectionPolicy::LeastBusy);
        let busy = pool.acquire();
        let next = pool.acquire();
        assert_ne!(busy.address(), next.address());
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let pool = pool(SelectionPolicy::RoundRobin);
        let first = pool.acquire().address();
        let second = pool.acquire().address();
        let third = pool.acquire().address();
        let fourth = pool.acquire().address();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[test]
    fn in_flight_tracks_live_guards() {
        let pool = pool(SelectionPolicy::LeastBusy);
        assert_eq!(pool.stats().in_flight, 0);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.stats().in_flight, 2);
        drop(a);
        assert_eq!(pool.stats().in_flight, 1);
        drop(b);
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[test]
    fn release_saturates_at_zero() {
        let state = RelayerState::new(address!("1000000000000000000000000000000000000001"), 0);
        state.release();
        state.release();
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn primary_is_first_configured_wallet() {
        let pool = pool(SelectionPolicy::LeastBusy);
        assert_eq!(
            pool.primary(),
            address!("1000000000000000000000000000000000000001")
        );
    }
}
