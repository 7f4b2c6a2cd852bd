//! The meta-relay pipeline: validate → verify → price → 402 or settle →
//! execute → respond.
//!
//! Payment settlement strictly happens-before execution: the settlement
//! receipt is awaited before the forwarder is called. Once settled, a
//! payment is never reversed — an execution failure returns the payment
//! hash with the error and the client may resubmit, since the forwarder
//! nonce was not consumed. No per-request state survives the response.

use alloy_primitives::U256;
use std::sync::Arc;
use tracing::instrument;

use crate::error::ApiError;
use crate::forwarder::ForwarderService;
use crate::payment::PaymentService;
use crate::pricing::{PriceQuote, PricingEngine, QuoteBody};
use crate::rate_limit::{RELAY_PER_MINUTE, RateLimiter};
use crate::stats::RelayStats;
use crate::types::{
    BatchItemOutcome, BatchRelayRequest, BatchRelayResponse, EvmAddress, NetworkId,
    PaymentRequiredBody, PaymentTerms, RelayRequest, RelayResponse, Scheme, X402Terms,
};

/// Batch size bounds for `/meta/batch`.
pub const MAX_BATCH_SIZE: usize = 10;

/// A pipeline result that may stop at the payment gate: either the terms
/// the client must satisfy, or the executed response.
#[derive(Debug)]
pub enum Gated<T> {
    PaymentRequired(Box<PaymentRequiredBody>),
    Ready(T),
}

/// Builds the exact 402 body: protocol terms plus the quote.
pub fn payment_required_body(
    network: NetworkId,
    stablecoin: EvmAddress,
    pay_to: EvmAddress,
    quote: &PriceQuote,
) -> PaymentRequiredBody {
    PaymentRequiredBody {
        error: "Payment Required".to_string(),
        x402: X402Terms {
            version: 1,
            accepts: vec![PaymentTerms {
                scheme: Scheme::Exact,
                network,
                asset: stablecoin,
                pay_to,
                max_amount_required: quote.final_price_raw.to_string(),
                description: format!(
                    "Gasless relay at {} priority (~{}s)",
                    quote.tier, quote.tier_config.estimated_time_secs
                ),
            }],
        },
        quote: QuoteBody::from(quote),
    }
}

pub fn validate_batch_size(size: usize) -> Result<(), ApiError> {
    if size == 0 || size > MAX_BATCH_SIZE {
        return Err(ApiError::Validation(format!(
            "batch size must be 1..={MAX_BATCH_SIZE}, got {size}"
        )));
    }
    Ok(())
}

pub struct RelayService {
    forwarder: Arc<ForwarderService>,
    payment: Arc<PaymentService>,
    pricing: Arc<PricingEngine>,
    stats: Arc<RelayStats>,
    limiter: Arc<RateLimiter>,
    network: NetworkId,
    stablecoin: alloy_primitives::Address,
}

impl RelayService {
    pub fn new(
        forwarder: Arc<ForwarderService>,
        payment: Arc<PaymentService>,
        pricing: Arc<PricingEngine>,
        stats: Arc<RelayStats>,
        limiter: Arc<RateLimiter>,
        network: NetworkId,
        stablecoin: alloy_primitives::Address,
    ) -> Self {
        Self {
            forwarder,
            payment,
            pricing,
            stats,
            limiter,
            network,
            stablecoin,
        }
    }

    fn terms(&self, quote: &PriceQuote) -> Box<PaymentRequiredBody> {
        Box::new(payment_required_body(
            self.network,
            EvmAddress(self.stablecoin),
            EvmAddress(self.payment.receiving_wallet()),
            quote,
        ))
    }

    /// Single relay, the `POST /meta/relay` pipeline.
    #[instrument(skip_all, fields(agent = %body.request.from))]
    pub async fn relay(
        &self,
        body: RelayRequest,
        payment_header: Option<String>,
    ) -> Result<Gated<RelayResponse>, ApiError> {
        let request = &body.request;

        // Address-keyed relay window; the IP-keyed one already ran in the
        // middleware.
        self.limiter
            .check("relay", &request.from.to_string(), RELAY_PER_MINUTE)
            .map_err(|retry_after| ApiError::RateLimited { retry_after })?;

        let verified = self.forwarder.verify(request, &body.signature).await?;
        if !verified {
            return Err(ApiError::InvalidSignature);
        }

        let tier = body.priority.unwrap_or_default();
        let quote = self.pricing.quote(request.gas.0, tier).await?;

        let Some(header) = payment_header else {
            return Ok(Gated::PaymentRequired(self.terms(&quote)));
        };

        let envelope =
            PaymentService::parse_header(&header).ok_or(ApiError::InvalidPayment)?;

        let verification = self.payment.verify(&envelope, quote.final_price_raw).await?;
        if !verification.valid {
            return Err(ApiError::PaymentInvalid {
                reason: verification
                    .reason
                    .unwrap_or_else(|| "payment rejected".to_string()),
            });
        }

        // Settlement and execution have external effects, so they run on a
        // detached task: a client disconnect drops this handler future but
        // must not abort work already paid for.
        let payment = Arc::clone(&self.payment);
        let forwarder = Arc::clone(&self.forwarder);
        let stats = Arc::clone(&self.stats);
        let request = body.request.clone();
        let signature = body.signature;
        let adjusted_gas_price = quote.adjusted_gas_price;
        let handle = tokio::spawn(async move {
            let payment_tx_hash =
                payment
                    .settle(&envelope)
                    .await
                    .map_err(|e| ApiError::PaymentFailed {
                        detail: e.to_string(),
                    })?;

            let gas_estimate: u64 = request.gas.0.try_into().unwrap_or(u64::MAX);
            let record = stats.open(
                request.from.0,
                forwarder.signing_hash(&request),
                gas_estimate,
            );

            match forwarder
                .execute(&request, &signature, Some(adjusted_gas_price))
                .await
            {
                Ok(outcome) => {
                    stats.confirm(
                        &record,
                        outcome.tx_hash,
                        Some(payment_tx_hash),
                        outcome.gas_used,
                        outcome.effective_gas_price,
                    );
                    Ok(RelayResponse {
                        success: outcome.success,
                        tx_hash: outcome.tx_hash.to_string(),
                        payment_tx_hash: payment_tx_hash.to_string(),
                        result: outcome.return_data.into(),
                        tier,
                    })
                }
                Err(error) => {
                    // Settled but not executed: the payment stands, the
                    // client retries the forwarder call (its nonce is
                    // unconsumed).
                    stats.fail(&record, Some(payment_tx_hash));
                    Err(ApiError::Chain(error))
                }
            }
        });

        let response = handle
            .await
            .map_err(|e| ApiError::Internal(format!("relay task failed: {e}")))??;
        Ok(Gated::Ready(response))
    }

    /// Batched relay, the `POST /meta/batch` pipeline: one payment, one
    /// discount, sequential execution, no rollback.
    #[instrument(skip_all, fields(batch = body.requests.len()))]
    pub async fn relay_batch(
        &self,
        body: BatchRelayRequest,
        payment_header: Option<String>,
    ) -> Result<Gated<BatchRelayResponse>, ApiError> {
        validate_batch_size(body.requests.len())?;

        let mut agents: Vec<String> = body
            .requests
            .iter()
            .map(|i| i.request.from.to_string())
            .collect();
        agents.sort();
        agents.dedup();
        for agent in &agents {
            self.limiter
                .check("relay", agent, RELAY_PER_MINUTE)
                .map_err(|retry_after| ApiError::RateLimited { retry_after })?;
        }

        // Any invalid signature rejects the whole batch before pricing.
        for item in &body.requests {
            let verified = self.forwarder.verify(&item.request, &item.signature).await?;
            if !verified {
                return Err(ApiError::InvalidSignature);
            }
        }

        let tier = body.priority.unwrap_or_default();
        let total_gas = body
            .requests
            .iter()
            .fold(U256::ZERO, |acc, item| acc + item.request.gas.0);
        let mut quote = self.pricing.quote(total_gas, tier).await?;
        quote.apply_discount_percent(10, self.pricing.policy().stablecoin_decimals);

        let Some(header) = payment_header else {
            return Ok(Gated::PaymentRequired(self.terms(&quote)));
        };

        let envelope =
            PaymentService::parse_header(&header).ok_or(ApiError::InvalidPayment)?;

        let verification = self.payment.verify(&envelope, quote.final_price_raw).await?;
        if !verification.valid {
            return Err(ApiError::PaymentInvalid {
                reason: verification
                    .reason
                    .unwrap_or_else(|| "payment rejected".to_string()),
            });
        }

        // As with the single pipeline: once money moves, the work detaches
        // from the request's lifetime.
        let payment = Arc::clone(&self.payment);
        let forwarder = Arc::clone(&self.forwarder);
        let stats = Arc::clone(&self.stats);
        let items = body.requests.clone();
        let adjusted_gas_price = quote.adjusted_gas_price;
        let handle = tokio::spawn(async move {
            let payment_tx_hash =
                payment
                    .settle(&envelope)
                    .await
                    .map_err(|e| ApiError::PaymentFailed {
                        detail: e.to_string(),
                    })?;

            // Settled once; execute in order, collecting per-item outcomes.
            let mut results = Vec::with_capacity(items.len());
            for item in &items {
                let gas_estimate: u64 = item.request.gas.0.try_into().unwrap_or(u64::MAX);
                let record = stats.open(
                    item.request.from.0,
                    forwarder.signing_hash(&item.request),
                    gas_estimate,
                );
                match forwarder
                    .execute(&item.request, &item.signature, Some(adjusted_gas_price))
                    .await
                {
                    Ok(outcome) => {
                        stats.confirm(
                            &record,
                            outcome.tx_hash,
                            Some(payment_tx_hash),
                            outcome.gas_used,
                            outcome.effective_gas_price,
                        );
                        results.push(BatchItemOutcome {
                            success: outcome.success,
                            to: item.request.to,
                            tx_hash: Some(outcome.tx_hash.to_string()),
                            error: None,
                        });
                    }
                    Err(error) => {
                        stats.fail(&record, Some(payment_tx_hash));
                        results.push(BatchItemOutcome {
                            success: false,
                            to: item.request.to,
                            tx_hash: None,
                            error: Some(error.to_string()),
                        });
                    }
                }
            }

            let success = results.iter().all(|r| r.success);
            Ok::<_, ApiError>(BatchRelayResponse {
                success,
                payment_tx_hash: payment_tx_hash.to_string(),
                results,
                tier,
            })
        });

        let response = handle
            .await
            .map_err(|e| ApiError::Internal(format!("batch task failed: {e}")))??;
        Ok(Gated::Ready(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{PricingPolicy, Priority};
    use alloy_primitives::{U256, address};

    fn sample_quote() -> PriceQuote {
        PricingPolicy {
            markup_percentage: 20.0,
            min_price_usd: 0.01,
            max_price_usd: 10.0,
            stablecoin_decimals: 6,
            quote_validity_secs: 60,
        }
        .price(
            U256::from(300_000u64),
            1000 * 1_000_000_000,
            0.15,
            Priority::Normal,
        )
    }

    #[test]
    fn payment_required_body_matches_protocol_shape() {
        let body = payment_required_body(
            NetworkId(25),
            EvmAddress(address!("c21223249ca28397b4b6541dffaecc539bff0c59")),
            EvmAddress(address!("70997970c51812dc3a010c7d01b50e0d17dc79c8")),
            &sample_quote(),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "Payment Required");
        assert_eq!(json["x402"]["version"], 1);
        let accepts = &json["x402"]["accepts"][0];
        assert_eq!(accepts["scheme"], "exact");
        assert_eq!(accepts["network"], "eip155:25");
        assert_eq!(accepts["maxAmountRequired"], "54000");
        assert!(accepts["payTo"].is_string());
        assert!(accepts["asset"].is_string());
        assert_eq!(json["quote"]["priceUSDC"], "0.054000");
        assert_eq!(json["quote"]["croPrice"], 0.15);
        assert_eq!(json["quote"]["priority"], "normal");
        assert!(json["quote"]["validUntil"].is_string());
    }

    #[test]
    fn batch_size_bounds() {
        assert!(validate_batch_size(0).is_err());
        assert!(validate_batch_size(1).is_ok());
        assert!(validate_batch_size(10).is_ok());
        assert!(validate_batch_size(11).is_err());
    }
}
