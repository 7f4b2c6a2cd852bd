//! Typed JSON-RPC boundary for the target chain.
//!
//! [`ChainAdapter`] owns the composed alloy provider (gas, blob-gas, nonce
//! and chain-id fillers plus the relayer wallet) and exposes the operations
//! the rest of the relay needs: balances, a floored gas price, gas
//! estimation, read-only calls for revert detection, and the
//! build→sign→broadcast→receipt path used for settlement and execution.
//! Every outbound call carries the configured timeout, and every failure is
//! classified into a [`ChainError`] whose `retriable` flag drives the
//! orchestrator's resync policy.

pub mod contracts;
pub mod nonce;

use alloy_network::{Ethereum, EthereumWallet, NetworkWallet, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy_provider::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionReceipt, TransactionRequest};
use alloy_signer::Signer;
use alloy_transport_http::Http;
use std::fmt::{Display, Formatter};
use std::future::IntoFuture;
use std::time::Duration;
use tracing::Instrument;

use crate::config::Config;
use contracts::IStablecoin;
pub use nonce::PendingNonceManager;

/// Combined filler type for gas, blob gas, nonce, and chain ID.
pub type InnerFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<PendingNonceManager>, ChainIdFiller>>,
>;

/// The fully composed provider: filler layers over a [`RootProvider`] plus
/// the relayer wallet for signing.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// Failure classes surfaced by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    /// Transport-level trouble: timeouts, connection failures, bad gateways.
    Network,
    /// The call or transaction reverted.
    Revert,
    /// The submitted nonce was already consumed.
    NonceTooLow,
    /// The node rejected the gas price (replacement or congestion).
    Underpriced,
    Unknown,
}

impl ChainErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ChainErrorKind::Network => "TX_NETWORK",
            ChainErrorKind::Revert => "TX_REVERT",
            ChainErrorKind::NonceTooLow => "TX_NONCE_TOO_LOW",
            ChainErrorKind::Underpriced => "TX_UNDERPRICED",
            ChainErrorKind::Unknown => "TX_UNKNOWN",
        }
    }
}

impl Display for ChainErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChainErrorKind::Network => "network",
            ChainErrorKind::Revert => "revert",
            ChainErrorKind::NonceTooLow => "nonce too low",
            ChainErrorKind::Underpriced => "underpriced",
            ChainErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A classified chain failure.
///
/// `retriable` means a nonce resync plus client-side resubmission may
/// succeed; it never triggers an internal retry of the full operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("chain error ({kind}): {detail}")]
pub struct ChainError {
    pub kind: ChainErrorKind,
    pub retriable: bool,
    pub detail: String,
}

impl ChainError {
    pub fn new(kind: ChainErrorKind, detail: impl Into<String>) -> Self {
        let retriable = matches!(
            kind,
            ChainErrorKind::Network | ChainErrorKind::NonceTooLow | ChainErrorKind::Underpriced
        );
        ChainError {
            kind,
            retriable,
            detail: detail.into(),
        }
    }

    /// Classifies an RPC error by its text. Nodes do not agree on error
    /// codes for nonce and fee problems, so this goes by the de-facto
    /// message fragments.
    pub fn classify<E: Display>(error: E) -> Self {
        let detail = error.to_string();
        let lower = detail.to_lowercase();
        let kind = if lower.contains("nonce too low") || lower.contains("invalid nonce") {
            ChainErrorKind::NonceTooLow
        } else if lower.contains("underpriced") || lower.contains("replacement transaction") {
            ChainErrorKind::Underpriced
        } else if lower.contains("revert") || lower.contains("out of gas") {
            ChainErrorKind::Revert
        } else if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection")
            || lower.contains("transport")
            || lower.contains("deser")
        {
            ChainErrorKind::Network
        } else {
            ChainErrorKind::Unknown
        };
        ChainError::new(kind, detail)
    }

    pub fn network(detail: impl Into<String>) -> Self {
        ChainError::new(ChainErrorKind::Network, detail)
    }
}

/// The capability boundary over the chain's JSON-RPC surface.
#[derive(Debug)]
pub struct ChainAdapter {
    provider: InnerProvider,
    chain_id: u64,
    stablecoin: Address,
    gas_price_floor: u128,
    rpc_timeout: Duration,
    receipt_timeout: Duration,
    nonce_manager: PendingNonceManager,
    signer_addresses: Vec<Address>,
}

impl ChainAdapter {
    /// Builds the provider stack from configuration: relayer signers bound
    /// to the chain id, an HTTP transport, and the pending-aware nonce
    /// filler.
    pub async fn connect(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let signers = config
            .signers()?
            .into_iter()
            .map(|s| s.with_chain_id(Some(config.chain_id)))
            .collect::<Vec<_>>();

        let wallet = {
            let mut iter = signers.into_iter();
            let first_signer = iter
                .next()
                .expect("config validation guarantees at least one signer");
            let mut wallet = EthereumWallet::from(first_signer);
            for signer in iter {
                wallet.register_signer(signer);
            }
            wallet
        };
        let signer_addresses =
            NetworkWallet::<Ethereum>::signer_addresses(&wallet).collect::<Vec<_>>();

        let transport = Http::new(config.chain_rpc_url.clone());
        let client = RpcClient::new(transport, false);

        let nonce_manager = PendingNonceManager::default();
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(nonce_manager.clone()),
                    ChainIdFiller::default(),
                ),
            ),
        );
        let provider: InnerProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);

        tracing::info!(
            chain_id = config.chain_id,
            rpc = %config.chain_rpc_url,
            relayers = ?signer_addresses,
            "connected chain adapter"
        );

        Ok(Self {
            provider,
            chain_id: config.chain_id,
            stablecoin: config.stablecoin_address,
            gas_price_floor: config.gas_price_floor_gwei as u128 * 1_000_000_000,
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
            nonce_manager,
            signer_addresses,
        })
    }

    pub fn provider(&self) -> &InnerProvider {
        &self.provider
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn stablecoin(&self) -> Address {
        self.stablecoin
    }

    pub fn signer_addresses(&self) -> &[Address] {
        &self.signer_addresses
    }

    /// Applies the configured timeout to an outbound RPC future.
    async fn with_timeout<T, E, F>(&self, label: &'static str, fut: F) -> Result<T, ChainError>
    where
        E: Display,
        F: IntoFuture<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ChainError::classify(e)),
            Err(_) => Err(ChainError::network(format!(
                "{label} timed out after {:?}",
                self.rpc_timeout
            ))),
        }
    }

    /// Native balance in wei.
    pub async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.with_timeout("get_balance", self.provider.get_balance(address))
            .instrument(tracing::info_span!("get_balance", %address, otel.kind = "client"))
            .await
    }

    /// Stablecoin balance in base units.
    pub async fn stablecoin_balance(&self, address: Address) -> Result<U256, ChainError> {
        let contract = IStablecoin::new(self.stablecoin, &self.provider);
        self.with_timeout("balanceOf", contract.balanceOf(address).call())
            .instrument(tracing::info_span!("balanceOf", %address, otel.kind = "client"))
            .await
    }

    /// Current gas price in wei, floored at the configured minimum. Some
    /// dev nodes report zero, which would produce unmineable transactions
    /// and absurd quotes.
    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        let reported = self
            .with_timeout("get_gas_price", self.provider.get_gas_price())
            .instrument(tracing::info_span!("get_gas_price", otel.kind = "client"))
            .await?;
        Ok(reported.max(self.gas_price_floor))
    }

    /// Transaction count including mempool entries.
    pub async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        self.with_timeout(
            "get_transaction_count",
            self.provider.get_transaction_count(address).pending(),
        )
        .instrument(tracing::info_span!("get_transaction_count", %address, otel.kind = "client"))
        .await
    }

    /// Gas estimate against the pending block.
    pub async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError> {
        self.with_timeout(
            "estimate_gas",
            self.provider.estimate_gas(tx).block(BlockId::pending()),
        )
        .instrument(tracing::info_span!("estimate_gas", otel.kind = "client"))
        .await
    }

    /// Read-only simulation; used for revert detection before spending gas.
    pub async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        self.with_timeout("call", self.provider.call(tx))
            .instrument(tracing::info_span!("call", otel.kind = "client"))
            .await
    }

    /// Broadcasts an already-signed raw transaction and returns its hash
    /// without waiting for inclusion.
    pub async fn send_signed(&self, raw: &[u8]) -> Result<B256, ChainError> {
        let pending = self
            .with_timeout(
                "send_raw_transaction",
                self.provider.send_raw_transaction(raw),
            )
            .instrument(tracing::info_span!("send_raw_transaction", otel.kind = "client"))
            .await?;
        Ok(*pending.tx_hash())
    }

    /// Fills, signs, broadcasts, and waits for the receipt of `tx`.
    ///
    /// The sending wallet is chosen by `tx.from`; the nonce filler allocates
    /// from that wallet's pending view. On any failure the wallet's nonce
    /// cache is invalidated, because the transaction may or may not have
    /// reached the mempool.
    pub async fn send(&self, mut tx: TransactionRequest) -> Result<TransactionReceipt, ChainError> {
        let from = tx.from.unwrap_or_default();
        if tx.gas_price.is_none() && tx.max_fee_per_gas.is_none() {
            let gas_price = self.gas_price().await?;
            tx.set_gas_price(gas_price);
        }
        if tx.gas.is_none() {
            let gas_limit = self.estimate_gas(tx.clone()).await?;
            tx.set_gas_limit(gas_limit);
        }

        let pending = match self
            .with_timeout("send_transaction", self.provider.send_transaction(tx))
            .instrument(tracing::info_span!("send_transaction", %from, otel.kind = "client"))
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.nonce_manager.reset(from).await;
                return Err(e);
            }
        };
        let tx_hash = *pending.tx_hash();

        let watcher = pending
            .with_required_confirmations(1)
            .with_timeout(Some(self.receipt_timeout));
        match watcher
            .get_receipt()
            .instrument(tracing::info_span!("get_receipt", %tx_hash, otel.kind = "client"))
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.nonce_manager.reset(from).await;
                Err(ChainError::classify(e))
            }
        }
    }

    /// Invalidates the cached nonce of a wallet; next submission re-reads
    /// the node's pending view.
    pub async fn reset_nonce(&self, address: Address) {
        self.nonce_manager.reset(address).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_nonce_errors_as_retriable() {
        let error = ChainError::classify("server returned an error: nonce too low");
        assert_eq!(error.kind, ChainErrorKind::NonceTooLow);
        assert!(error.retriable);
    }

    #[test]
    fn classifies_underpriced_as_retriable() {
        let error = ChainError::classify("replacement transaction underpriced");
        assert_eq!(error.kind, ChainErrorKind::Underpriced);
        assert!(error.retriable);
    }

    #[test]
    fn classifies_reverts_as_terminal() {
        let error = ChainError::classify("execution reverted: ERC20: transfer amount exceeds balance");
        assert_eq!(error.kind, ChainErrorKind::Revert);
        assert!(!error.retriable);
    }

    #[test]
    fn classifies_transport_trouble_as_network() {
        let error = ChainError::classify("connection refused (os error 111)");
        assert_eq!(error.kind, ChainErrorKind::Network);
        assert!(error.retriable);
    }

    #[test]
    fn unknown_errors_are_not_retriable() {
        let error = ChainError::classify("something novel happened");
        assert_eq!(error.kind, ChainErrorKind::Unknown);
        assert!(!error.retriable);
    }

    #[test]
    fn kind_codes_match_error_taxonomy() {
        assert_eq!(ChainErrorKind::Revert.code(), "TX_REVERT");
        assert_eq!(ChainErrorKind::NonceTooLow.code(), "TX_NONCE_TOO_LOW");
    }
}
