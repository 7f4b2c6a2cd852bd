//! EIP-3009 payment handling: header parsing, verification, settlement.
//!
//! The client pre-authorizes a stablecoin transfer off-chain and ships it in
//! the `X-Payment` header. Verification walks the checks in a fixed order
//! and reports the first failure; settlement submits
//! `transferWithAuthorization` from a pool wallet and treats anything but a
//! successful receipt as terminal for the request — a submitted settlement
//! is never retried internally.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, Bytes, FixedBytes, U256};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::SolCall;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::contracts::IStablecoin;
use crate::chain::{ChainAdapter, ChainError, ChainErrorKind};
use crate::relayer::RelayerPool;
use crate::timestamp::UnixTimestamp;
use crate::types::PaymentEnvelope;

/// Outcome of payment verification. `reason` carries the first failing
/// check when `valid` is false.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl VerificationOutcome {
    fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Settlement failure: either the chain interaction failed or the
/// settlement transaction mined but reverted.
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("settlement transaction reverted: {tx_hash}")]
    Reverted { tx_hash: B256 },
}

#[derive(Debug)]
pub struct PaymentService {
    adapter: Arc<ChainAdapter>,
    pool: Arc<RelayerPool>,
    receiving_wallet: Address,
}

impl PaymentService {
    pub fn new(adapter: Arc<ChainAdapter>, pool: Arc<RelayerPool>, receiving_wallet: Address) -> Self {
        Self {
            adapter,
            pool,
            receiving_wallet,
        }
    }

    pub fn receiving_wallet(&self) -> Address {
        self.receiving_wallet
    }

    /// Decodes an `X-Payment` header value. Any failure — bad base64, bad
    /// JSON, wrong shape — yields `None`; the caller maps that to a 400.
    pub fn parse_header(header: &str) -> Option<PaymentEnvelope> {
        let raw = BASE64.decode(header.trim().as_bytes()).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// The inverse of [`Self::parse_header`]: the header form a client sends.
    pub fn encode_header(envelope: &PaymentEnvelope) -> String {
        let raw = serde_json::to_vec(envelope).expect("envelope has no unserializable fields");
        BASE64.encode(raw)
    }

    /// The off-chain checks, in order: recipient, amount, validity window.
    /// The first failure wins; later checks are not evaluated.
    pub fn check_terms(
        envelope: &PaymentEnvelope,
        expected_amount: U256,
        receiving_wallet: Address,
        now: UnixTimestamp,
    ) -> Result<(), String> {
        let authorization = &envelope.payload.authorization;
        if authorization.to.0 != receiving_wallet {
            return Err(format!(
                "Invalid recipient: payment must go to {receiving_wallet}"
            ));
        }
        if authorization.value.0 < expected_amount {
            return Err(format!(
                "Insufficient amount: authorized {} but {} required",
                authorization.value.0, expected_amount
            ));
        }
        if now.0 <= authorization.valid_after.0 {
            return Err(format!(
                "Authorization not yet valid: validAfter {}",
                authorization.valid_after
            ));
        }
        if now.0 >= authorization.valid_before.0 {
            return Err(format!(
                "Authorization expired: validBefore {}",
                authorization.valid_before
            ));
        }
        Ok(())
    }

    /// Full verification: the ordered off-chain checks, then the on-chain
    /// state — the authorization must be unused and the payer funded.
    #[instrument(skip_all, fields(payer = %envelope.payload.authorization.from))]
    pub async fn verify(
        &self,
        envelope: &PaymentEnvelope,
        expected_amount: U256,
    ) -> Result<VerificationOutcome, ChainError> {
        let now = UnixTimestamp::try_now()
            .map_err(|e| ChainError::new(ChainErrorKind::Unknown, format!("clock: {e}")))?;
        if let Err(reason) = Self::check_terms(envelope, expected_amount, self.receiving_wallet, now)
        {
            return Ok(VerificationOutcome::invalid(reason));
        }

        let authorization = &envelope.payload.authorization;
        if self
            .authorization_state(authorization.from.0, authorization.nonce.0)
            .await?
        {
            return Ok(VerificationOutcome::invalid(
                "Authorization already used on-chain",
            ));
        }

        let balance = self.adapter.stablecoin_balance(authorization.from.0).await?;
        if balance < authorization.value.0 {
            return Ok(VerificationOutcome::invalid(format!(
                "Insufficient balance: payer holds {balance}, authorization needs {}",
                authorization.value.0
            )));
        }

        Ok(VerificationOutcome::valid())
    }

    async fn authorization_state(&self, from: Address, nonce: [u8; 32]) -> Result<bool, ChainError> {
        let calldata = IStablecoin::authorizationStateCall {
            authorizer: from,
            nonce: FixedBytes(nonce),
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .with_to(self.adapter.stablecoin())
            .with_input(Bytes::from(calldata));
        let returned = self.adapter.call(tx).await?;
        IStablecoin::authorizationStateCall::abi_decode_returns(&returned).map_err(|e| {
            ChainError::new(
                ChainErrorKind::Unknown,
                format!("authorizationState decode: {e}"),
            )
        })
    }

    /// Submits `transferWithAuthorization` from a pool wallet and waits for
    /// its receipt. The signature is split `r || s || v` per EIP-3009.
    #[instrument(skip_all, fields(payer = %envelope.payload.authorization.from))]
    pub async fn settle(&self, envelope: &PaymentEnvelope) -> Result<B256, SettleError> {
        let authorization = &envelope.payload.authorization;
        let signature = &envelope.payload.signature;

        let calldata = IStablecoin::transferWithAuthorizationCall {
            from: authorization.from.0,
            to: authorization.to.0,
            value: authorization.value.0,
            validAfter: authorization.valid_after.into(),
            validBefore: authorization.valid_before.into(),
            nonce: FixedBytes(authorization.nonce.0),
            v: signature.v(),
            r: FixedBytes(signature.r()),
            s: FixedBytes(signature.s()),
        }
        .abi_encode();

        let relayer = self.pool.acquire();
        let tx = TransactionRequest::default()
            .with_from(relayer.address())
            .with_to(self.adapter.stablecoin())
            .with_input(Bytes::from(calldata));

        let receipt = self.adapter.send(tx).await?;
        if !receipt.status() {
            tracing::warn!(tx = %receipt.transaction_hash, "settlement reverted");
            return Err(SettleError::Reverted {
                tx_hash: receipt.transaction_hash,
            });
        }
        tracing::info!(
            tx = %receipt.transaction_hash,
            payer = %authorization.from,
            value = %authorization.value,
            "payment settled"
        );
        Ok(receipt.transaction_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AuthorizationNonce, EvmAddress, EvmSignature, NetworkId, PaymentAuthorization,
        PaymentPayload, Scheme, TokenAmount,
    };
    use alloy_primitives::address;

    const RECEIVER: Address = address!("70997970c51812dc3a010c7d01b50e0d17dc79c8");

    fn envelope(value: u64, valid_after: u64, valid_before: u64, to: Address) -> PaymentEnvelope {
        PaymentEnvelope {
            version: 1,
            scheme: Scheme::Exact,
            network: NetworkId(25),
            payload: PaymentPayload {
                signature: EvmSignature([0x11; 65]),
                authorization: PaymentAuthorization {
                    from: EvmAddress(address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266")),
                    to: EvmAddress(to),
                    value: TokenAmount::from(value),
                    valid_after: UnixTimestamp(valid_after),
                    valid_before: UnixTimestamp(valid_before),
                    nonce: AuthorizationNonce([0x22; 32]),
                },
            },
        }
    }

    #[test]
    fn header_encode_then_parse_is_identity() {
        let original = envelope(54_000, 0, 2_000_000_000, RECEIVER);
        let header = PaymentService::encode_header(&original);
        let parsed = PaymentService::parse_header(&header).unwrap();
        assert_eq!(parsed.payload.authorization.value.0, U256::from(54_000u64));
        assert_eq!(parsed.payload.authorization.to.0, RECEIVER);
        assert_eq!(parsed.network, NetworkId(25));
    }

    #[test]
    fn parse_header_swallows_garbage() {
        assert!(PaymentService::parse_header("!!definitely not base64!!").is_none());
        let valid_b64_bad_json = BASE64.encode(b"{\"version\":");
        assert!(PaymentService::parse_header(&valid_b64_bad_json).is_none());
        let wrong_shape = BASE64.encode(b"{\"version\":1}");
        assert!(PaymentService::parse_header(&wrong_shape).is_none());
    }

    #[test]
    fn parse_header_tolerates_surrounding_whitespace() {
        let original = envelope(54_000, 0, 2_000_000_000, RECEIVER);
        let header = format!("  {}\n", PaymentService::encode_header(&original));
        assert!(PaymentService::parse_header(&header).is_some());
    }

    #[test]
    fn accepts_a_well_formed_payment() {
        let env = envelope(54_000, 100, 2_000_000_000, RECEIVER);
        let result = PaymentService::check_terms(
            &env,
            U256::from(54_000u64),
            RECEIVER,
            UnixTimestamp(1_000_000),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_wrong_recipient_first() {
        let env = envelope(10, 100, 50, address!("0000000000000000000000000000000000000bad"));
        // Everything else about this envelope is wrong too; the recipient
        // check must win because it runs first.
        let reason = PaymentService::check_terms(
            &env,
            U256::from(54_000u64),
            RECEIVER,
            UnixTimestamp(1_000_000),
        )
        .unwrap_err();
        assert!(reason.contains("Invalid recipient"), "{reason}");
    }

    #[test]
    fn rejects_amount_one_unit_short() {
        let env = envelope(53_999, 0, 2_000_000_000, RECEIVER);
        let reason = PaymentService::check_terms(
            &env,
            U256::from(54_000u64),
            RECEIVER,
            UnixTimestamp(1_000_000),
        )
        .unwrap_err();
        assert!(reason.contains("Insufficient amount"), "{reason}");
    }

    #[test]
    fn rejects_authorization_expired_one_second_ago() {
        let now = 1_000_000u64;
        let env = envelope(54_000, 0, now - 1, RECEIVER);
        let reason =
            PaymentService::check_terms(&env, U256::from(54_000u64), RECEIVER, UnixTimestamp(now))
                .unwrap_err();
        assert!(reason.contains("Authorization expired"), "{reason}");
    }

    #[test]
    fn rejects_authorization_not_yet_valid() {
        let now = 1_000_000u64;
        let env = envelope(54_000, now + 10, now + 100, RECEIVER);
        let reason =
            PaymentService::check_terms(&env, U256::from(54_000u64), RECEIVER, UnixTimestamp(now))
                .unwrap_err();
        assert!(reason.contains("not yet valid"), "{reason}");
    }

    #[test]
    fn recipient_comparison_ignores_hex_case() {
        // Parse the same address in two casings; the canonical comparison
        // must treat them as equal.
        let upper: EvmAddress =
            serde_json::from_str("\"0x70997970C51812DC3A010C7D01B50E0D17DC79C8\"").unwrap();
        let mut env = envelope(54_000, 0, 2_000_000_000, RECEIVER);
        env.payload.authorization.to = upper;
        let result = PaymentService::check_terms(
            &env,
            U256::from(54_000u64),
            RECEIVER,
            UnixTimestamp(1_000_000),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn exact_amount_is_sufficient() {
        let env = envelope(54_000, 0, 2_000_000_000, RECEIVER);
        assert!(
            PaymentService::check_terms(
                &env,
                U256::from(54_000u64),
                RECEIVER,
                UnixTimestamp(1_000_000),
            )
            .is_ok()
        );
    }
}
