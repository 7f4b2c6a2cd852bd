//! EIP-2771 forwarder service: typed-data domain, verification, execution.
//!
//! Clients sign a `ForwardRequest` under the forwarder's EIP-712 domain; the
//! on-chain contract is the authority for verification (signature recovery,
//! nonce equality, deadline) via its `verify` view, and `execute` performs
//! the inner call with the signer appended to calldata. The inner call's
//! outcome is read back from the `Executed` event: an inner revert still
//! mines the outer transaction successfully.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, Bytes};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::{Eip712Domain, SolCall, SolStruct, eip712_domain};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::contracts::IMinimalForwarder;
use crate::chain::{ChainAdapter, ChainError, ChainErrorKind};
use crate::pricing::with_gas_buffer;
use crate::relayer::{RelayerGuard, RelayerPool};
use crate::types::{EvmSignature, ForwardRequest};

/// Result of one forwarder execution. `success` reflects the inner call;
/// the outer transaction referenced by `tx_hash` mined either way.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub tx_hash: B256,
    pub success: bool,
    pub return_data: Bytes,
    pub relayer: Address,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

#[derive(Debug)]
pub struct ForwarderService {
    adapter: Arc<ChainAdapter>,
    pool: Arc<RelayerPool>,
    address: Address,
    domain: Eip712Domain,
}

impl ForwarderService {
    pub fn new(adapter: Arc<ChainAdapter>, pool: Arc<RelayerPool>, address: Address) -> Self {
        let domain = eip712_domain! {
            name: "MinimalForwarder",
            version: "1",
            chain_id: adapter.chain_id(),
            verifying_contract: address,
        };
        Self {
            adapter,
            pool,
            address,
            domain,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    /// The domain as served to clients. Field for field the same values the
    /// verifier hashes, so a client signing this shape produces signatures
    /// the contract accepts.
    pub fn domain_json(&self) -> serde_json::Value {
        json!({
            "name": "MinimalForwarder",
            "version": "1",
            "chainId": self.adapter.chain_id(),
            "verifyingContract": self.address.to_string(),
        })
    }

    /// The `ForwardRequest` type schema for typed-data signing.
    pub fn types_json() -> serde_json::Value {
        json!({
            "ForwardRequest": [
                { "name": "from", "type": "address" },
                { "name": "to", "type": "address" },
                { "name": "value", "type": "uint256" },
                { "name": "gas", "type": "uint256" },
                { "name": "nonce", "type": "uint256" },
                { "name": "deadline", "type": "uint256" },
                { "name": "data", "type": "bytes" },
            ]
        })
    }

    fn as_sol_request(request: &ForwardRequest) -> IMinimalForwarder::ForwardRequest {
        IMinimalForwarder::ForwardRequest {
            from: request.from.0,
            to: request.to.0,
            value: request.value.0,
            gas: request.gas.0,
            nonce: request.nonce.0,
            deadline: request.deadline.into(),
            data: request.data.0.clone(),
        }
    }

    /// EIP-712 signing hash of `request` under this forwarder's domain.
    pub fn signing_hash(&self, request: &ForwardRequest) -> B256 {
        Self::as_sol_request(request).eip712_signing_hash(&self.domain)
    }

    /// Current forwarder nonce of `address`.
    #[instrument(skip(self), fields(forwarder = %self.address))]
    pub async fn get_nonce(&self, address: Address) -> Result<alloy_primitives::U256, ChainError> {
        let calldata = IMinimalForwarder::getNonceCall { from: address }.abi_encode();
        let tx = TransactionRequest::default()
            .with_to(self.address)
            .with_input(Bytes::from(calldata));
        let returned = self.adapter.call(tx).await?;
        IMinimalForwarder::getNonceCall::abi_decode_returns(&returned)
            .map_err(|e| ChainError::new(ChainErrorKind::Unknown, format!("getNonce decode: {e}")))
    }

    /// Asks the forwarder contract whether `signature` is valid for
    /// `request`: recovery to `from`, nonce equality, and deadline all in
    /// one view call.
    #[instrument(skip_all, fields(agent = %request.from))]
    pub async fn verify(
        &self,
        request: &ForwardRequest,
        signature: &EvmSignature,
    ) -> Result<bool, ChainError> {
        let calldata = IMinimalForwarder::verifyCall {
            request: Self::as_sol_request(request),
            signature: Bytes::from(signature.0.to_vec()),
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .with_to(self.address)
            .with_input(Bytes::from(calldata));
        let returned = self.adapter.call(tx).await?;
        IMinimalForwarder::verifyCall::abi_decode_returns(&returned)
            .map_err(|e| ChainError::new(ChainErrorKind::Unknown, format!("verify decode: {e}")))
    }

    /// Executes a verified request through the forwarder from a pool wallet.
    ///
    /// The wallet is held for the duration of the job and released on every
    /// exit path; nonce and fee failures trigger a pool resync before the
    /// error is surfaced (retriable, the client resubmits).
    #[instrument(skip_all, fields(agent = %request.from, target = %request.to))]
    pub async fn execute(
        &self,
        request: &ForwardRequest,
        signature: &EvmSignature,
        gas_price: Option<u128>,
    ) -> Result<ExecutionOutcome, ChainError> {
        let relayer = self.pool.acquire();
        let result = self
            .execute_from(&relayer, request, signature, gas_price)
            .await;
        if let Err(error) = &result
            && matches!(
                error.kind,
                ChainErrorKind::NonceTooLow | ChainErrorKind::Underpriced
            )
            && let Err(resync_error) = self.pool.resync(&self.adapter, relayer.address()).await
        {
            tracing::warn!(
                relayer = %relayer.address(),
                error = %resync_error,
                "nonce resync failed"
            );
        }
        result
    }

    async fn execute_from(
        &self,
        relayer: &RelayerGuard,
        request: &ForwardRequest,
        signature: &EvmSignature,
        gas_price: Option<u128>,
    ) -> Result<ExecutionOutcome, ChainError> {
        let calldata = IMinimalForwarder::executeCall {
            request: Self::as_sol_request(request),
            signature: Bytes::from(signature.0.to_vec()),
        }
        .abi_encode();

        let mut tx = TransactionRequest::default()
            .with_from(relayer.address())
            .with_to(self.address)
            .with_value(request.value.0)
            .with_input(Bytes::from(calldata));

        let outer_gas = self.adapter.estimate_gas(tx.clone()).await?;
        tx.gas = Some(with_gas_buffer(outer_gas));
        if let Some(gas_price) = gas_price {
            tx.gas_price = Some(gas_price);
        }

        let receipt = self.adapter.send(tx).await?;
        if !receipt.status() {
            return Err(ChainError::new(
                ChainErrorKind::Revert,
                format!("forwarder execute reverted: {}", receipt.transaction_hash),
            ));
        }

        // Inner outcome comes from the Executed event; absent the event the
        // outer status is all we know.
        let mut success = receipt.status();
        let mut return_data = Bytes::new();
        for log in receipt.inner.logs() {
            if let Ok(decoded) = log.log_decode::<IMinimalForwarder::Executed>() {
                let event = decoded.inner.data;
                success = event.success;
                return_data = event.result;
                break;
            }
        }

        tracing::info!(
            tx = %receipt.transaction_hash,
            inner_success = success,
            relayer = %relayer.address(),
            "forwarder execute mined"
        );

        Ok(ExecutionOutcome {
            tx_hash: receipt.transaction_hash,
            success,
            return_data,
            relayer: relayer.address(),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::UnixTimestamp;
    use crate::types::{EvmAddress, HexBytes, TokenAmount};
    use alloy_primitives::{U256, address};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn sample_request(from: Address) -> ForwardRequest {
        ForwardRequest {
            from: EvmAddress(from),
            to: EvmAddress(address!("70997970c51812dc3a010c7d01b50e0d17dc79c8")),
            value: TokenAmount::default(),
            gas: TokenAmount::from(100_000u64),
            nonce: TokenAmount::from(7u64),
            deadline: UnixTimestamp(1_893_456_000),
            data: HexBytes(Bytes::from(vec![0xd0, 0x9d, 0xe0, 0x8a])),
        }
    }

    fn test_domain(chain_id: u64, forwarder: Address) -> Eip712Domain {
        eip712_domain! {
            name: "MinimalForwarder",
            version: "1",
            chain_id: chain_id,
            verifying_contract: forwarder,
        }
    }

    #[test]
    fn forward_request_type_string_matches_schema() {
        let root = IMinimalForwarder::ForwardRequest::eip712_root_type();
        assert_eq!(
            root,
            "ForwardRequest(address from,address to,uint256 value,uint256 gas,uint256 nonce,uint256 deadline,bytes data)"
        );
    }

    #[test]
    fn signature_over_signing_hash_recovers_signer() {
        let signer = PrivateKeySigner::random();
        let request = sample_request(signer.address());
        let domain = test_domain(25, address!("5fbdb2315678afecb367f032d93f642f64180aa3"));
        let hash = ForwarderService::as_sol_request(&request).eip712_signing_hash(&domain);

        let signature = signer.sign_hash_sync(&hash).unwrap();
        let recovered = signature.recover_address_from_prehash(&hash).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn different_domains_produce_different_hashes() {
        let request = sample_request(address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
        let forwarder = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
        let sol_request = ForwarderService::as_sol_request(&request);
        let mainnet = sol_request.eip712_signing_hash(&test_domain(25, forwarder));
        let testnet = sol_request.eip712_signing_hash(&test_domain(338, forwarder));
        assert_ne!(mainnet, testnet);
    }

    #[test]
    fn types_json_lists_every_field_in_order() {
        let types = ForwarderService::types_json();
        let fields: Vec<&str> = types["ForwardRequest"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            fields,
            ["from", "to", "value", "gas", "nonce", "deadline", "data"]
        );
    }

    #[test]
    fn sol_request_preserves_wire_values() {
        let request = sample_request(address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
        let sol_request = ForwarderService::as_sol_request(&request);
        assert_eq!(sol_request.gas, U256::from(100_000u64));
        assert_eq!(sol_request.nonce, U256::from(7u64));
        assert_eq!(sol_request.deadline, U256::from(1_893_456_000u64));
        assert_eq!(sol_request.data.len(), 4);
    }
}
