//! In-process counters and ephemeral per-transaction records.
//!
//! Observability only: nothing here survives a restart, and the record map
//! is capped. Relayed work lost on crash is re-submitted by clients.

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_RECORDS: usize = 1024;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One relayed transaction as seen by `/health` consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub id: String,
    pub agent: Address,
    pub envelope_hash: B256,
    pub status: TxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_tx_hash: Option<B256>,
    pub gas_estimate: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
    pub created_millis: u64,
    pub updated_millis: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub total: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub pending: u64,
}

/// Relay-wide transaction accounting.
#[derive(Debug, Default)]
pub struct RelayStats {
    total: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
    records: DashMap<String, TxRecord>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a pending record and returns its id.
    pub fn open(&self, agent: Address, envelope_hash: B256, gas_estimate: u64) -> String {
        self.total.fetch_add(1, Ordering::AcqRel);
        let id = format!("{:016x}", rand::rng().random::<u64>());
        let now = now_millis();
        self.evict_if_full();
        self.records.insert(
            id.clone(),
            TxRecord {
                id: id.clone(),
                agent,
                envelope_hash,
                status: TxStatus::Pending,
                tx_hash: None,
                payment_tx_hash: None,
                gas_estimate,
                gas_used: None,
                gas_price: None,
                created_millis: now,
                updated_millis: now,
            },
        );
        id
    }

    pub fn confirm(
        &self,
        id: &str,
        tx_hash: B256,
        payment_tx_hash: Option<B256>,
        gas_used: u64,
        gas_price: u128,
    ) {
        self.confirmed.fetch_add(1, Ordering::AcqRel);
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = TxStatus::Confirmed;
            record.tx_hash = Some(tx_hash);
            record.payment_tx_hash = payment_tx_hash;
            record.gas_used = Some(gas_used);
            record.gas_price = Some(gas_price);
            record.updated_millis = now_millis();
        }
    }

    pub fn fail(&self, id: &str, payment_tx_hash: Option<B256>) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = TxStatus::Failed;
            record.payment_tx_hash = payment_tx_hash;
            record.updated_millis = now_millis();
        }
    }

    pub fn counters(&self) -> Counters {
        let total = self.total.load(Ordering::Acquire);
        let confirmed = self.confirmed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        Counters {
            total,
            confirmed,
            failed,
            pending: total.saturating_sub(confirmed + failed),
        }
    }

    fn evict_if_full(&self) {
        if self.records.len() < MAX_RECORDS {
            return;
        }
        let oldest = self
            .records
            .iter()
            .min_by_key(|r| r.created_millis)
            .map(|r| r.id.clone());
        if let Some(id) = oldest {
            self.records.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn counters_follow_lifecycle() {
        let stats = RelayStats::new();
        let agent = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        let id_a = stats.open(agent, B256::ZERO, 100_000);
        let id_b = stats.open(agent, B256::ZERO, 100_000);
        assert_eq!(stats.counters().pending, 2);

        stats.confirm(&id_a, B256::repeat_byte(1), Some(B256::repeat_byte(2)), 90_000, 5_000);
        stats.fail(&id_b, None);

        let counters = stats.counters();
        assert_eq!(counters.total, 2);
        assert_eq!(counters.confirmed, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.pending, 0);
    }

    #[test]
    fn record_ids_are_unique() {
        let stats = RelayStats::new();
        let agent = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        let a = stats.open(agent, B256::ZERO, 1);
        let b = stats.open(agent, B256::ZERO, 1);
        assert_ne!(a, b);
    }
}
