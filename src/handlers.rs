//! HTTP endpoints of the relay.
//!
//! Handlers stay thin: extract, delegate to the service container, map the
//! outcome. Payment gating surfaces here as a 402 response carrying the
//! protocol terms; everything else funnels through [`ApiError`].

use alloy_primitives::{Address, Bytes, U256, hex};
use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::ChainAdapter;
use crate::error::ApiError;
use crate::forwarder::ForwarderService;
use crate::pricing::{PricingEngine, Priority, QuoteBody};
use crate::rebalance::{AutoRebalancer, NATIVE_THRESHOLD_UNITS};
use crate::relay::{Gated, RelayService};
use crate::relayer::RelayerPool;
use crate::stats::RelayStats;
use crate::types::{BatchRelayRequest, RelayRequest};

/// Header carrying the base64 payment envelope.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Root service container, wired once at startup and shared by reference.
pub struct AppInner {
    pub relay: RelayService,
    pub adapter: Arc<ChainAdapter>,
    pub pool: Arc<RelayerPool>,
    pub pricing: Arc<PricingEngine>,
    pub forwarder: Arc<ForwarderService>,
    pub stats: Arc<RelayStats>,
    pub rebalance: Option<Arc<AutoRebalancer>>,
}

pub type AppState = Arc<AppInner>;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/estimate", get(get_estimate))
        .route("/meta/domain", get(get_domain))
        .route("/meta/nonce/{address}", get(get_nonce))
        .route("/meta/relay", post(post_relay))
        .route("/meta/batch", post(post_batch))
}

#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

fn wei_to_units(wei: U256) -> f64 {
    wei.to_string().parse::<f64>().unwrap_or(f64::MAX) / 1e18
}

/// `GET /health`: liveness plus balances, pool, pricing, and counters.
/// Degrades to 503 when the primary wallet cannot pay for gas.
#[instrument(skip_all)]
async fn get_health(State(state): State<AppState>) -> Response {
    let mut warnings: Vec<String> = Vec::new();
    let mut relayers = Vec::new();
    let mut primary_units = 0.0f64;

    for (index, address) in state.pool.addresses().iter().enumerate() {
        match state.adapter.native_balance(*address).await {
            Ok(wei) => {
                let units = wei_to_units(wei);
                if index == 0 {
                    primary_units = units;
                }
                relayers.push(json!({
                    "address": address.to_string(),
                    "nativeBalance": format!("{units:.6}"),
                }));
            }
            Err(e) => {
                warnings.push(format!("Balance check failed for {address}: {e}"));
            }
        }
    }

    let healthy = primary_units >= NATIVE_THRESHOLD_UNITS;
    if !healthy {
        warnings.insert(
            0,
            format!(
                "Low native balance on primary relayer {}: {primary_units:.4} < {NATIVE_THRESHOLD_UNITS}",
                state.pool.primary()
            ),
        );
    }

    let gas_price_gwei = match state.adapter.gas_price().await {
        Ok(wei) => format!("{}", wei / 1_000_000_000),
        Err(e) => {
            warnings.push(format!("Gas price unavailable: {e}"));
            "unavailable".to_string()
        }
    };

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "warnings": warnings,
        "relayers": relayers,
        "pool": state.pool.stats(),
        "gasPriceGwei": gas_price_gwei,
        "oracle": state.pricing.oracle().snapshot(),
        "transactions": state.stats.counters(),
        "rebalance": state.rebalance.as_ref().map(|r| r.status()),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct EstimateQuery {
    to: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EstimateResponse {
    gas_estimate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote: Option<QuoteBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quotes: Option<serde_json::Value>,
}

/// `GET /estimate?to&data&value&priority?`: gas plus a quote, or quotes for
/// every tier when no priority is named.
#[instrument(skip_all)]
async fn get_estimate(
    State(state): State<AppState>,
    params: Result<Query<EstimateQuery>, QueryRejection>,
) -> Result<Json<EstimateResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::Validation(e.body_text()))?;
    let to = Address::from_str(&params.to)
        .map_err(|_| ApiError::Validation(format!("invalid target address: {}", params.to)))?;
    let data = match &params.data {
        Some(s) => Bytes::from(
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|_| ApiError::Validation("invalid calldata hex".to_string()))?,
        ),
        None => Bytes::new(),
    };
    let value = match &params.value {
        Some(s) => U256::from_str_radix(s, 10)
            .map_err(|_| ApiError::Validation("invalid value: expected decimal string".into()))?,
        None => U256::ZERO,
    };
    let priority = params
        .priority
        .as_deref()
        .map(Priority::from_str)
        .transpose()
        .map_err(ApiError::Validation)?;

    let gas = state
        .pricing
        .estimate_gas(state.pool.primary(), to, data, value)
        .await;
    let gas_estimate = U256::from(gas);

    match priority {
        Some(tier) => {
            let quote = state.pricing.quote(gas_estimate, tier).await?;
            Ok(Json(EstimateResponse {
                gas_estimate: gas_estimate.to_string(),
                quote: Some(QuoteBody::from(&quote)),
                quotes: None,
            }))
        }
        None => {
            let mut quotes = serde_json::Map::new();
            for tier in Priority::all() {
                let quote = state.pricing.quote(gas_estimate, tier).await?;
                quotes.insert(
                    tier.to_string(),
                    serde_json::to_value(QuoteBody::from(&quote))
                        .map_err(|e| ApiError::Internal(e.to_string()))?,
                );
            }
            Ok(Json(EstimateResponse {
                gas_estimate: gas_estimate.to_string(),
                quote: None,
                quotes: Some(serde_json::Value::Object(quotes)),
            }))
        }
    }
}

/// `GET /meta/domain`: the EIP-712 shape clients must sign.
#[instrument(skip_all)]
async fn get_domain(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "domain": state.forwarder.domain_json(),
        "types": ForwarderService::types_json(),
        "forwarderAddress": state.forwarder.address().to_string(),
    }))
}

/// `GET /meta/nonce/{address}`: current forwarder nonce of an agent.
#[instrument(skip_all)]
async fn get_nonce(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address = Address::from_str(&address)
        .map_err(|_| ApiError::Validation(format!("invalid address: {address}")))?;
    let nonce = state.forwarder.get_nonce(address).await?;
    Ok(Json(json!({
        "address": address.to_string(),
        "nonce": nonce.to_string(),
    })))
}

fn payment_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn gated<T: Serialize>(outcome: Gated<T>) -> Response {
    match outcome {
        Gated::Ready(body) => (StatusCode::OK, Json(body)).into_response(),
        Gated::PaymentRequired(terms) => {
            (StatusCode::PAYMENT_REQUIRED, Json(terms)).into_response()
        }
    }
}

/// `POST /meta/relay`: single meta-transaction.
#[instrument(skip_all)]
async fn post_relay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let outcome = state.relay.relay(request, payment_header(&headers)).await?;
    Ok(gated(outcome))
}

/// `POST /meta/batch`: 1..=10 meta-transactions under one payment.
#[instrument(skip_all)]
async fn post_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BatchRelayRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let outcome = state
        .relay
        .relay_batch(request, payment_header(&headers))
        .await?;
    Ok(gated(outcome))
}
