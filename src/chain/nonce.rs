use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_provider::fillers::NonceManager;
use alloy_transport::TransportResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Nonce source for relayer wallets.
///
/// The first transaction from a wallet fetches the node's `pending`
/// transaction count, which includes mempool entries, so a restart while
/// transactions are in flight does not produce "nonce too low". Subsequent
/// transactions increment the cached value locally. After any submission or
/// receipt failure the cache entry is invalidated and the next use queries
/// the node again — this is the resync required by the relayer pool.
///
/// Each wallet's nonce sits behind its own `Mutex`, so concurrent jobs that
/// land on the same wallet serialize only at nonce allocation, not for the
/// whole submission.
#[derive(Clone, Debug, Default)]
pub struct PendingNonceManager {
    nonces: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
}

// Sentinel marking a nonce that must be re-fetched from the node.
const UNKNOWN: u64 = u64::MAX;

#[async_trait]
impl NonceManager for PendingNonceManager {
    async fn get_next_nonce<P, N>(&self, provider: &P, address: Address) -> TransportResult<u64>
    where
        P: Provider<N>,
        N: alloy_network::Network,
    {
        // Clone the Arc under the short-lived map guard; the await below must
        // not happen while the dashmap shard is locked.
        let slot = {
            let entry = self
                .nonces
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(UNKNOWN)));
            Arc::clone(entry.value())
        };

        let mut nonce = slot.lock().await;
        let next = if *nonce == UNKNOWN {
            tracing::trace!(%address, "fetching pending nonce");
            provider.get_transaction_count(address).pending().await?
        } else {
            tracing::trace!(%address, current_nonce = *nonce, "incrementing nonce");
            *nonce + 1
        };
        *nonce = next;
        Ok(next)
    }
}

impl PendingNonceManager {
    /// Invalidates the cached nonce for `address`; the next allocation
    /// queries the node's pending view.
    pub async fn reset(&self, address: Address) {
        if let Some(slot) = self.nonces.get(&address) {
            let mut nonce = slot.lock().await;
            *nonce = UNKNOWN;
            tracing::debug!(%address, "nonce cache reset, will requery on next use");
        }
    }
}
