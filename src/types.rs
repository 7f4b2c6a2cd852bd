//! Wire types for the relay HTTP surface.
//!
//! Every integer crosses the wire as a decimal string and every byte blob as
//! 0x-prefixed hex; the newtypes here validate those encodings at the
//! deserialization boundary so the rest of the pipeline works with typed
//! records. The key objects are [`ForwardRequest`] (the signed meta-tx
//! envelope), [`PaymentEnvelope`] (the decoded `X-Payment` header), and the
//! response bodies of `/meta/relay` and `/meta/batch`.

use alloy_primitives::{Address, Bytes, U256, hex};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;

use crate::timestamp::UnixTimestamp;

/// Wrapper around [`Address`] providing display and serde support.
///
/// Deserialization accepts any hex casing; comparisons happen on the
/// canonical 20-byte value, so two addresses differing only in case are equal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvmAddress(pub Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        EvmAddress(address)
    }
}

/// A 65-byte ECDSA signature over EIP-712 typed data.
///
/// Serialized as a 0x-prefixed hex string of 130 characters, laid out as
/// `r(32) || s(32) || v(1)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl EvmSignature {
    pub fn r(&self) -> [u8; 32] {
        self.0[0..32].try_into().expect("slice length is 32")
    }

    pub fn s(&self) -> [u8; 32] {
        self.0[32..64].try_into().expect("slice length is 32")
    }

    /// Recovery byte, normalized to the 27/28 convention used by EIP-3009.
    pub fn v(&self) -> u8 {
        let v = self.0[64];
        if v < 27 { v + 27 } else { v }
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static SIG_REGEX: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("Invalid regex for EVM signature")
        });

        if SIG_REGEX.is_match(&s) {
            let bytes = hex::decode(s.trim_start_matches("0x"))
                .map_err(|_| Error::custom("Failed to decode EVM signature hex string"))?;

            let array: [u8; 65] = bytes
                .try_into()
                .map_err(|_| Error::custom("Signature must be exactly 65 bytes"))?;

            Ok(EvmSignature(array))
        } else {
            Err(Error::custom(
                "Invalid EVM signature format: must be 0x-prefixed and 130 hex chars",
            ))
        }
    }
}

impl Serialize for EvmSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex_string = format!("0x{}", hex::encode(self.0));
        serializer.serialize_str(&hex_string)
    }
}

/// A 32-byte EIP-3009 authorization nonce, hex-encoded with 0x prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AuthorizationNonce(pub [u8; 32]);

impl<'de> Deserialize<'de> for AuthorizationNonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static NONCE_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid nonce regex"));

        if !NONCE_REGEX.is_match(&s) {
            return Err(Error::custom("Invalid nonce format"));
        }

        let bytes = hex::decode(&s[2..]).map_err(|_| Error::custom("Invalid hex in nonce"))?;

        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::custom("Invalid length for nonce"))?;

        Ok(AuthorizationNonce(array))
    }
}

impl Serialize for AuthorizationNonce {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex_string = format!("0x{}", hex::encode(self.0));
        serializer.serialize_str(&hex_string)
    }
}

/// An arbitrary-precision integer carried as a decimal string on the wire.
///
/// Used for native values, gas limits, forwarder nonces, and stablecoin base
/// units.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TokenAmount(pub U256);

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::custom("amount must be a base-10 unsigned integer"));
        }
        let value = U256::from_str_radix(&s, 10)
            .map_err(|_| Error::custom("amount exceeds 256 bits"))?;
        Ok(TokenAmount(value))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        TokenAmount(value)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

/// Opaque calldata bytes, 0x-prefixed hex on the wire. An empty payload
/// serializes as `"0x"`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexBytes(pub Bytes);

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let stripped = s
            .strip_prefix("0x")
            .ok_or_else(|| Error::custom("byte payload must be 0x-prefixed hex"))?;
        let bytes =
            hex::decode(stripped).map_err(|_| Error::custom("Invalid hex in byte payload"))?;
        Ok(HexBytes(Bytes::from(bytes)))
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl From<Bytes> for HexBytes {
    fn from(value: Bytes) -> Self {
        HexBytes(value)
    }
}

/// The signed meta-transaction envelope (EIP-2771 trusted-forwarder shape).
///
/// Constructed by the client, immutable through the pipeline, consumed once:
/// the forwarder contract rejects replay by incrementing the per-agent nonce
/// atomically on execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    /// The agent the inner call is executed on behalf of.
    pub from: EvmAddress,
    /// Target contract of the inner call.
    pub to: EvmAddress,
    /// Native value forwarded with the inner call.
    pub value: TokenAmount,
    /// Requested inner gas limit.
    pub gas: TokenAmount,
    /// The agent's current forwarder nonce.
    pub nonce: TokenAmount,
    /// Unix-seconds expiry of the envelope.
    pub deadline: UnixTimestamp,
    /// Inner calldata.
    pub data: HexBytes,
}

/// EIP-3009 `transferWithAuthorization` parameters signed by the payer.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: AuthorizationNonce,
}

/// Signature plus authorization, the `payload` member of the envelope.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub signature: EvmSignature,
    pub authorization: PaymentAuthorization,
}

/// Payment scheme. Only `exact` is supported: the authorized amount must
/// meet or exceed the quoted price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Exact => write!(f, "exact"),
        }
    }
}

/// The structured document carried base64-encoded in the `X-Payment` header.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub version: u8,
    pub scheme: Scheme,
    /// CAIP-2 style chain identifier, e.g. `eip155:25`.
    #[serde(with = "network_string")]
    pub network: NetworkId,
    pub payload: PaymentPayload,
}

/// A `<family>:<chainId>` network identifier for EVM chains.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkId(pub u64);

impl Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eip155:{}", self.0)
    }
}

mod network_string {
    use super::NetworkId;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NetworkId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NetworkId, D::Error> {
        let s = String::deserialize(deserializer)?;
        let reference = s
            .strip_prefix("eip155:")
            .ok_or_else(|| Error::custom("network must use the eip155 namespace"))?;
        let chain_id = reference
            .parse::<u64>()
            .map_err(|_| Error::custom("invalid eip155 chain reference"))?;
        Ok(NetworkId(chain_id))
    }
}

/// Body of `POST /meta/relay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub request: ForwardRequest,
    pub signature: EvmSignature,
    #[serde(default)]
    pub priority: Option<crate::pricing::Priority>,
}

/// One entry of a batch relay body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRelayItem {
    pub request: ForwardRequest,
    pub signature: EvmSignature,
}

/// Body of `POST /meta/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRelayRequest {
    pub requests: Vec<BatchRelayItem>,
    #[serde(default)]
    pub priority: Option<crate::pricing::Priority>,
}

/// Successful `POST /meta/relay` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    /// Whether the inner (forwarded) call succeeded. The outer transaction
    /// mined either way.
    pub success: bool,
    pub tx_hash: String,
    pub payment_tx_hash: String,
    pub result: HexBytes,
    pub tier: crate::pricing::Priority,
}

/// Per-item outcome of a batch relay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemOutcome {
    pub success: bool,
    pub to: EvmAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Successful `POST /meta/batch` response. `success` is true iff every
/// inner call succeeded; settlement is not reversed for partial batches.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRelayResponse {
    pub success: bool,
    pub payment_tx_hash: String,
    pub results: Vec<BatchItemOutcome>,
    pub tier: crate::pricing::Priority,
}

/// One `accepts` entry of the 402 terms.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTerms {
    pub scheme: Scheme,
    #[serde(with = "network_string")]
    pub network: NetworkId,
    pub asset: EvmAddress,
    pub pay_to: EvmAddress,
    pub max_amount_required: String,
    pub description: String,
}

/// The `x402` member of the 402 body.
#[derive(Debug, Clone, Serialize)]
pub struct X402Terms {
    pub version: u8,
    pub accepts: Vec<PaymentTerms>,
}

/// The full 402 Payment Required body: protocol terms plus the quote the
/// client is expected to meet.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequiredBody {
    pub error: String,
    pub x402: X402Terms,
    pub quote: crate::pricing::QuoteBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn forward_request_roundtrips_decimal_strings() {
        let json = r#"{
            "from": "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
            "to": "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
            "value": "0",
            "gas": "100000",
            "nonce": "7",
            "deadline": "1893456000",
            "data": "0xd09de08a"
        }"#;
        let request: ForwardRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.gas.0, U256::from(100000u64));
        assert_eq!(request.nonce.0, U256::from(7u64));
        assert_eq!(request.data.0.len(), 4);

        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["gas"], "100000");
        assert_eq!(encoded["deadline"], "1893456000");
        assert_eq!(encoded["data"], "0xd09de08a");
    }

    #[test]
    fn token_amount_rejects_junk() {
        for bad in ["\"\"", "\"12.5\"", "\"-1\"", "\"0x10\"", "\"ten\""] {
            let parsed: Result<TokenAmount, _> = serde_json::from_str(bad);
            assert!(parsed.is_err(), "expected rejection of {bad}");
        }
    }

    #[test]
    fn signature_split_normalizes_v() {
        let mut raw = [0u8; 65];
        raw[0] = 0xaa;
        raw[63] = 0xbb;
        raw[64] = 1;
        let sig = EvmSignature(raw);
        assert_eq!(sig.r()[0], 0xaa);
        assert_eq!(sig.s()[31], 0xbb);
        assert_eq!(sig.v(), 28);

        raw[64] = 27;
        assert_eq!(EvmSignature(raw).v(), 27);
    }

    #[test]
    fn signature_deserialize_enforces_length() {
        let short = format!("\"0x{}\"", "ab".repeat(64));
        let parsed: Result<EvmSignature, _> = serde_json::from_str(&short);
        assert!(parsed.is_err());
    }

    #[test]
    fn payment_envelope_roundtrip() {
        let envelope = PaymentEnvelope {
            version: 1,
            scheme: Scheme::Exact,
            network: NetworkId(25),
            payload: PaymentPayload {
                signature: EvmSignature([0x11; 65]),
                authorization: PaymentAuthorization {
                    from: EvmAddress(address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266")),
                    to: EvmAddress(address!("70997970c51812dc3a010c7d01b50e0d17dc79c8")),
                    value: TokenAmount::from(54_000u64),
                    valid_after: UnixTimestamp(0),
                    valid_before: UnixTimestamp(1893456000),
                    nonce: AuthorizationNonce([0x22; 32]),
                },
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"network\":\"eip155:25\""));
        assert!(json.contains("\"scheme\":\"exact\""));
        let back: PaymentEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.network, NetworkId(25));
        assert_eq!(back.payload.authorization.value.0, U256::from(54_000u64));
    }

    #[test]
    fn addresses_compare_case_insensitively_after_parse() {
        let lower: EvmAddress =
            serde_json::from_str("\"0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266\"").unwrap();
        let upper: EvmAddress =
            serde_json::from_str("\"0xF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266\"").unwrap();
        assert_eq!(lower, upper);
    }
}
