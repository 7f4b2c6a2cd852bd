//! Pricing: gas estimates, priority tiers, and stablecoin quotes.
//!
//! The arithmetic splits cleanly in two: gas × gas-price stays in
//! arbitrary-precision integers, while all monetary math happens in floating
//! point at microdollar resolution and is converted to integer base units by
//! formatting to six decimal places and parsing. [`PricingPolicy`] holds the
//! pure computation; [`PricingEngine`] binds it to the chain adapter and the
//! cached native/USD spot.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, Bytes, U256};
use alloy_rpc_types_eth::TransactionRequest;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::chain::{ChainAdapter, ChainError};

/// Seed value for the native/USD spot before the first successful oracle
/// fetch.
pub const FALLBACK_NATIVE_USD: f64 = 0.10;

/// Gas estimate used when simulation fails.
pub const DEFAULT_GAS_ESTIMATE: u64 = 500_000;

/// Absolute price floor in USD, regardless of configuration.
pub const ABSOLUTE_MIN_USD: f64 = 0.005;

/// Priority tier requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl Priority {
    pub fn all() -> [Priority; 3] {
        [Priority::Slow, Priority::Normal, Priority::Fast]
    }

    /// Fixed tier parameters: markup multiplier, gas-price multiplier, and
    /// the latency the tier advertises.
    pub fn tier(&self) -> TierConfig {
        match self {
            Priority::Slow => TierConfig {
                markup_multiplier: 0.5,
                gas_price_multiplier: 0.8,
                estimated_time_secs: 30,
            },
            Priority::Normal => TierConfig {
                markup_multiplier: 1.0,
                gas_price_multiplier: 1.0,
                estimated_time_secs: 10,
            },
            Priority::Fast => TierConfig {
                markup_multiplier: 2.0,
                gas_price_multiplier: 1.5,
                estimated_time_secs: 3,
            },
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Slow => "slow",
            Priority::Normal => "normal",
            Priority::Fast => "fast",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slow" => Ok(Priority::Slow),
            "normal" => Ok(Priority::Normal),
            "fast" => Ok(Priority::Fast),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Parameters of one priority tier.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub markup_multiplier: f64,
    pub gas_price_multiplier: f64,
    pub estimated_time_secs: u64,
}

/// A priced relay. Quotes are pure values: the server retains nothing, the
/// client simply attaches a payment meeting `final_price_raw`.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub gas_estimate: U256,
    /// Gas price after the tier multiplier, wei.
    pub adjusted_gas_price: u128,
    pub native_usd_price: f64,
    pub base_cost_usd: f64,
    pub markup_factor: f64,
    pub final_price_usd: f64,
    /// Human form, six decimal places.
    pub final_price_human: String,
    /// Stablecoin base units.
    pub final_price_raw: U256,
    pub valid_until: DateTime<Utc>,
    pub tier: Priority,
    pub tier_config: TierConfig,
}

impl PriceQuote {
    /// Applies a percentage discount to the stablecoin amount, flooring in
    /// integer math, and refreshes the derived human/USD fields.
    pub fn apply_discount_percent(&mut self, percent: u8, decimals: u8) {
        let keep = U256::from(100 - percent as u64);
        self.final_price_raw = self.final_price_raw * keep / U256::from(100u64);
        self.final_price_human = base_units_to_human(self.final_price_raw, decimals);
        self.final_price_usd = self.final_price_human.parse().unwrap_or(self.final_price_usd);
    }
}

/// Wire form of a quote, as embedded in 402 bodies and `/estimate`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteBody {
    pub gas_estimate: String,
    pub gas_price_gwei: String,
    #[serde(rename = "croPrice")]
    pub cro_price: f64,
    #[serde(rename = "priceUSDC")]
    pub price_usdc: String,
    pub priority: Priority,
    pub valid_until: String,
}

impl From<&PriceQuote> for QuoteBody {
    fn from(quote: &PriceQuote) -> Self {
        QuoteBody {
            gas_estimate: quote.gas_estimate.to_string(),
            gas_price_gwei: format_gwei(quote.adjusted_gas_price),
            cro_price: quote.native_usd_price,
            price_usdc: quote.final_price_human.clone(),
            priority: quote.tier,
            valid_until: quote
                .valid_until
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Wei to a decimal gwei string, fractional part trimmed.
fn format_gwei(wei: u128) -> String {
    let whole = wei / 1_000_000_000;
    let frac = wei % 1_000_000_000;
    if frac == 0 {
        whole.to_string()
    } else {
        let s = format!("{whole}.{frac:09}");
        s.trim_end_matches('0').to_string()
    }
}

fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

/// USD to stablecoin base units: format to six decimals, parse the digits,
/// rescale when the token uses a different decimal count.
pub fn usd_to_base_units(usd: f64, decimals: u8) -> (String, U256) {
    let human = format!("{:.6}", usd.max(0.0));
    let (int_part, frac_part) = human
        .split_once('.')
        .expect("fixed-precision format always contains a dot");
    let micro = int_part.parse::<u128>().unwrap_or(0) * 1_000_000
        + frac_part.parse::<u128>().unwrap_or(0);
    let raw = if decimals >= 6 {
        U256::from(micro) * U256::from(10u64).pow(U256::from(decimals as u64 - 6))
    } else {
        U256::from(micro) / U256::from(10u64).pow(U256::from(6 - decimals as u64))
    };
    (human, raw)
}

/// Base units back to a human string with six displayed decimals.
pub fn base_units_to_human(raw: U256, decimals: u8) -> String {
    let micro = if decimals >= 6 {
        raw / U256::from(10u64).pow(U256::from(decimals as u64 - 6))
    } else {
        raw * U256::from(10u64).pow(U256::from(6 - decimals as u64))
    };
    let micro: u128 = micro.try_into().unwrap_or(u128::MAX);
    format!("{}.{:06}", micro / 1_000_000, micro % 1_000_000)
}

/// Adds the 20% safety buffer to a gas estimate.
pub fn with_gas_buffer(gas: u64) -> u64 {
    gas + gas / 5
}

/// The pure pricing computation, independent of any I/O.
#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub markup_percentage: f64,
    pub min_price_usd: f64,
    pub max_price_usd: f64,
    pub stablecoin_decimals: u8,
    pub quote_validity_secs: u64,
}

impl PricingPolicy {
    /// Prices `gas_estimate` at `tier` given the current gas price and spot.
    ///
    /// Steps: tier-adjusted gas price, base cost in USD, markup scaled by
    /// the tier, clamp to `[max(min_usd x tier, 0.005), max_usd]`, then
    /// conversion to stablecoin base units.
    pub fn price(
        &self,
        gas_estimate: U256,
        gas_price_wei: u128,
        native_usd: f64,
        tier: Priority,
    ) -> PriceQuote {
        let tier_config = tier.tier();
        let adjusted_gas_price =
            (gas_price_wei as f64 * tier_config.gas_price_multiplier).floor() as u128;

        let wei_cost = gas_estimate * U256::from(adjusted_gas_price);
        let base_cost_usd = u256_to_f64(wei_cost) / 1e18 * native_usd;

        let markup_factor = 1.0 + (self.markup_percentage / 100.0) * tier_config.markup_multiplier;
        let unclamped = base_cost_usd * markup_factor;

        let floor_usd = (self.min_price_usd * tier_config.markup_multiplier).max(ABSOLUTE_MIN_USD);
        let final_price_usd = unclamped.max(floor_usd).min(self.max_price_usd);

        let (final_price_human, final_price_raw) =
            usd_to_base_units(final_price_usd, self.stablecoin_decimals);

        PriceQuote {
            gas_estimate,
            adjusted_gas_price,
            native_usd_price: native_usd,
            base_cost_usd,
            markup_factor,
            final_price_usd,
            final_price_human,
            final_price_raw,
            valid_until: Utc::now() + chrono::Duration::seconds(self.quote_validity_secs as i64),
            tier,
            tier_config,
        }
    }
}

/// Snapshot of the cached spot for `/health`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleSnapshot {
    pub native_usd: f64,
    pub fetched_at_millis: Option<u64>,
}

/// Cached native/USD spot, refreshed by a background task.
///
/// The cached value is a single scalar: the refresher takes the write lock
/// briefly, readers take an uncontended snapshot. On fetch failure the
/// previous value is retained; the hard fallback seeds the first value.
#[derive(Debug)]
pub struct PriceOracle {
    spot: RwLock<f64>,
    fetched_at_millis: AtomicU64,
    client: reqwest::Client,
    url: Option<Url>,
    api_key: Option<String>,
}

impl PriceOracle {
    pub fn new(url: Option<Url>, api_key: Option<String>) -> Self {
        Self {
            spot: RwLock::new(FALLBACK_NATIVE_USD),
            fetched_at_millis: AtomicU64::new(0),
            client: reqwest::Client::new(),
            url,
            api_key,
        }
    }

    pub fn spot(&self) -> f64 {
        *self.spot.read().expect("spot lock poisoned")
    }

    pub fn set_spot(&self, value: f64) {
        *self.spot.write().expect("spot lock poisoned") = value;
    }

    pub fn snapshot(&self) -> OracleSnapshot {
        let fetched = self.fetched_at_millis.load(Ordering::Acquire);
        OracleSnapshot {
            native_usd: self.spot(),
            fetched_at_millis: (fetched > 0).then_some(fetched),
        }
    }

    /// One fetch of the external price API. Expects a
    /// `{"<asset-id>": {"usd": <number>}}` shaped body.
    pub async fn refresh(&self) {
        let Some(url) = &self.url else {
            return;
        };
        let mut request = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let fetched = async {
            let body: serde_json::Value = request.send().await?.error_for_status()?.json().await?;
            Ok::<_, reqwest::Error>(body)
        }
        .await;

        match fetched.as_ref().map(Self::extract_usd) {
            Ok(Some(value)) if value > 0.0 => {
                self.set_spot(value);
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                self.fetched_at_millis.store(now, Ordering::Release);
                tracing::debug!(native_usd = value, "refreshed spot price");
            }
            Ok(_) => {
                tracing::warn!("price oracle response missing usd field, keeping previous spot");
            }
            Err(e) => {
                tracing::warn!(error = %e, "price oracle fetch failed, keeping previous spot");
            }
        }
    }

    fn extract_usd(body: &serde_json::Value) -> Option<f64> {
        body.as_object()?
            .values()
            .find_map(|entry| entry.get("usd").and_then(|v| v.as_f64()))
    }

    /// Spawns the periodic refresh under the task tracker; the task exits
    /// when the cancellation token fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        every: Duration,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) {
        let oracle = Arc::clone(self);
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => oracle.refresh().await,
                }
            }
            tracing::debug!("price oracle refresh task stopped");
        });
    }
}

/// Pricing bound to the chain adapter and oracle.
#[derive(Debug)]
pub struct PricingEngine {
    adapter: Arc<ChainAdapter>,
    oracle: Arc<PriceOracle>,
    policy: PricingPolicy,
}

impl PricingEngine {
    pub fn new(adapter: Arc<ChainAdapter>, oracle: Arc<PriceOracle>, policy: PricingPolicy) -> Self {
        Self {
            adapter,
            oracle,
            policy,
        }
    }

    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }

    pub fn oracle(&self) -> &Arc<PriceOracle> {
        &self.oracle
    }

    /// Simulated gas for an inner call, submitted as the relayer, with the
    /// 20% buffer applied. Falls back to [`DEFAULT_GAS_ESTIMATE`] when the
    /// node refuses to estimate.
    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> u64 {
        let tx = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_value(value)
            .with_input(data);
        match self.adapter.estimate_gas(tx).await {
            Ok(gas) => with_gas_buffer(gas),
            Err(e) => {
                tracing::warn!(error = %e, "gas estimation failed, using default");
                DEFAULT_GAS_ESTIMATE
            }
        }
    }

    /// Quotes `gas_estimate` at `tier` against the live gas price and the
    /// cached spot.
    pub async fn quote(&self, gas_estimate: U256, tier: Priority) -> Result<PriceQuote, ChainError> {
        let gas_price = self.adapter.gas_price().await?;
        let spot = self.oracle.spot();
        Ok(self.policy.price(gas_estimate, gas_price, spot, tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PricingPolicy {
        PricingPolicy {
            markup_percentage: 20.0,
            min_price_usd: 0.01,
            max_price_usd: 10.0,
            stablecoin_decimals: 6,
            quote_validity_secs: 60,
        }
    }

    const GWEI: u128 = 1_000_000_000;

    #[test]
    fn batch_operating_point_prices_and_discounts_exactly() {
        // Three requests of 100k gas priced as one 300k estimate. At a
        // 1000 gwei adjusted gas price, $0.15 spot, and 20% markup the
        // total is $0.054 -> 54000 base units; the 10% batch discount
        // floors to 48600.
        let quote = policy().price(U256::from(300_000u64), 1000 * GWEI, 0.15, Priority::Normal);
        assert_eq!(quote.final_price_human, "0.054000");
        assert_eq!(quote.final_price_raw, U256::from(54_000u64));

        let mut discounted = quote.clone();
        discounted.apply_discount_percent(10, 6);
        assert_eq!(discounted.final_price_raw, U256::from(48_600u64));
        assert_eq!(discounted.final_price_human, "0.048600");
    }

    #[test]
    fn discount_floors_in_integer_math() {
        let mut quote = policy().price(U256::from(300_000u64), 1000 * GWEI, 0.15, Priority::Normal);
        quote.final_price_raw = U256::from(54_001u64);
        quote.apply_discount_percent(10, 6);
        // 54001 * 0.9 = 48600.9, floored.
        assert_eq!(quote.final_price_raw, U256::from(48_600u64));
    }

    #[test]
    fn tiers_are_monotonic() {
        let p = policy();
        let gas = U256::from(500_000u64);
        let slow = p.price(gas, 5000 * GWEI, 0.15, Priority::Slow);
        let normal = p.price(gas, 5000 * GWEI, 0.15, Priority::Normal);
        let fast = p.price(gas, 5000 * GWEI, 0.15, Priority::Fast);
        assert!(fast.final_price_raw >= normal.final_price_raw);
        assert!(normal.final_price_raw >= slow.final_price_raw);
    }

    #[test]
    fn adjusted_gas_price_uses_tier_multiplier_with_floor() {
        let quote = policy().price(U256::from(21_000u64), 5000 * GWEI, 0.15, Priority::Slow);
        assert_eq!(quote.adjusted_gas_price, 4000 * GWEI);
    }

    #[test]
    fn tiny_jobs_hit_the_tier_scaled_floor() {
        let p = policy();
        // 21k gas at 1 gwei is microscopic; the floor takes over.
        let normal = p.price(U256::from(21_000u64), GWEI, 0.15, Priority::Normal);
        assert_eq!(normal.final_price_usd, 0.01);
        let fast = p.price(U256::from(21_000u64), GWEI, 0.15, Priority::Fast);
        assert_eq!(fast.final_price_usd, 0.02);
        // Slow scales the configured floor below the absolute minimum's
        // reach: max(0.01 * 0.5, 0.005) = 0.005.
        let slow = p.price(U256::from(21_000u64), GWEI, 0.15, Priority::Slow);
        assert_eq!(slow.final_price_usd, 0.005);
    }

    #[test]
    fn huge_jobs_clamp_to_the_ceiling() {
        let quote = policy().price(
            U256::from(30_000_000u64),
            50_000 * GWEI,
            1.5,
            Priority::Fast,
        );
        assert_eq!(quote.final_price_usd, 10.0);
        assert_eq!(quote.final_price_raw, U256::from(10_000_000u64));
    }

    #[test]
    fn usd_conversion_formats_then_parses() {
        let (human, raw) = usd_to_base_units(0.0545, 6);
        assert_eq!(human, "0.054500");
        assert_eq!(raw, U256::from(54_500u64));

        let (human, raw) = usd_to_base_units(1.0, 6);
        assert_eq!(human, "1.000000");
        assert_eq!(raw, U256::from(1_000_000u64));

        // 18-decimal token scales up by 10^12.
        let (_, raw) = usd_to_base_units(0.054, 18);
        assert_eq!(raw, U256::from(54_000_000_000_000_000u64));
    }

    #[test]
    fn human_rendering_roundtrips_base_units() {
        assert_eq!(base_units_to_human(U256::from(48_600u64), 6), "0.048600");
        assert_eq!(base_units_to_human(U256::from(1_234_567u64), 6), "1.234567");
    }

    #[test]
    fn gas_buffer_adds_twenty_percent() {
        assert_eq!(with_gas_buffer(100_000), 120_000);
        assert_eq!(with_gas_buffer(0), 0);
    }

    #[test]
    fn gwei_formatting_trims_zeroes() {
        assert_eq!(format_gwei(5000 * GWEI), "5000");
        assert_eq!(format_gwei(1_500_000_000), "1.5");
    }

    #[test]
    fn quote_body_uses_protocol_field_names() {
        let quote = policy().price(U256::from(300_000u64), 1000 * GWEI, 0.15, Priority::Fast);
        let body = QuoteBody::from(&quote);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("croPrice").is_some());
        assert!(json.get("priceUSDC").is_some());
        assert_eq!(json["priority"], "fast");
        assert_eq!(json["gasEstimate"], "300000");
    }

    #[test]
    fn oracle_keeps_fallback_until_first_fetch() {
        let oracle = PriceOracle::new(None, None);
        assert_eq!(oracle.spot(), FALLBACK_NATIVE_USD);
        assert!(oracle.snapshot().fetched_at_millis.is_none());
        oracle.set_spot(0.15);
        assert_eq!(oracle.spot(), 0.15);
    }

    #[test]
    fn oracle_extracts_usd_from_nested_body() {
        let body = serde_json::json!({"crypto-com-chain": {"usd": 0.153}});
        assert_eq!(PriceOracle::extract_usd(&body), Some(0.153));
        let empty = serde_json::json!({"crypto-com-chain": {"eur": 0.14}});
        assert_eq!(PriceOracle::extract_usd(&empty), None);
    }

    #[test]
    fn priority_parses_from_query_strings() {
        assert_eq!("fast".parse::<Priority>().unwrap(), Priority::Fast);
        assert!("warp".parse::<Priority>().is_err());
    }
}
