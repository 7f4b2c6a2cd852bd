//! Relay HTTP entrypoint.
//!
//! Boots the service container in dependency order — chain adapter, relayer
//! pool, price oracle, pricing engine, forwarder and payment services, the
//! orchestrator — then serves the Axum router until SIGTERM/SIGINT.
//! Background tasks (price refresh, auto-rebalance) run under a task
//! tracker and are cancelled and joined on shutdown.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use relay402::chain::ChainAdapter;
use relay402::config::Config;
use relay402::forwarder::ForwarderService;
use relay402::handlers::{self, AppInner};
use relay402::payment::PaymentService;
use relay402::pricing::{PriceOracle, PricingEngine, PricingPolicy};
use relay402::rate_limit::{self, RateLimiter};
use relay402::rebalance::AutoRebalancer;
use relay402::relay::RelayService;
use relay402::relayer::{RelayerPool, SelectionPolicy};
use relay402::stats::RelayStats;
use relay402::telemetry::Telemetry;
use relay402::types::NetworkId;

/// Cancellation token cancelled on SIGTERM or SIGINT. Each signal gets its
/// own detached listener task; whichever fires first wins, the rest die
/// with the process.
fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let token = CancellationToken::new();
    for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
        let mut stream = signal(kind)?;
        let token = token.clone();
        tokio::spawn(async move {
            stream.recv().await;
            token.cancel();
        });
    }
    Ok(token)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = Config::load()?;
    let telemetry = Telemetry::init(&config.node_env);

    let adapter = Arc::new(ChainAdapter::connect(&config).await?);
    let pool =
        Arc::new(RelayerPool::from_chain(&adapter, SelectionPolicy::LeastBusy).await?);

    let oracle = Arc::new(PriceOracle::new(
        config.price_oracle_url.clone(),
        config.price_oracle_api_key.clone(),
    ));
    // Seed the spot before the first quote; a failed fetch keeps the
    // fallback constant.
    oracle.refresh().await;

    let cancel = shutdown_token()?;
    let tracker = TaskTracker::new();
    oracle.spawn_refresh(
        Duration::from_secs(config.price_refresh_secs),
        &tracker,
        cancel.clone(),
    );

    let pricing = Arc::new(PricingEngine::new(
        Arc::clone(&adapter),
        Arc::clone(&oracle),
        PricingPolicy {
            markup_percentage: config.markup_percentage,
            min_price_usd: config.min_price_usd,
            max_price_usd: config.max_price_usd,
            stablecoin_decimals: config.stablecoin_decimals,
            quote_validity_secs: config.quote_validity_secs,
        },
    ));
    let forwarder = Arc::new(ForwarderService::new(
        Arc::clone(&adapter),
        Arc::clone(&pool),
        config.forwarder_address,
    ));
    let payment = Arc::new(PaymentService::new(
        Arc::clone(&adapter),
        Arc::clone(&pool),
        config.receiving_wallet,
    ));
    let stats = Arc::new(RelayStats::new());
    let limiter = Arc::new(RateLimiter::new());

    let rebalance = AutoRebalancer::from_config(
        &config,
        Arc::clone(&adapter),
        Arc::clone(&oracle),
        pool.primary(),
    );
    if let Some(rebalancer) = &rebalance {
        rebalancer.spawn(&tracker, cancel.clone());
    } else {
        tracing::info!("auto-rebalance disabled: swap route not configured");
    }

    let relay = RelayService::new(
        Arc::clone(&forwarder),
        Arc::clone(&payment),
        Arc::clone(&pricing),
        Arc::clone(&stats),
        Arc::clone(&limiter),
        NetworkId(config.chain_id),
        config.stablecoin_address,
    );

    let state = Arc::new(AppInner {
        relay,
        adapter,
        pool,
        pricing,
        forwarder,
        stats,
        rebalance,
    });

    let app = Router::new()
        .merge(handlers::routes())
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&limiter),
            rate_limit::middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting relay at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let serve_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
    .await?;

    // Stop background tasks and flush telemetry before exiting.
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    telemetry.shutdown();

    Ok(())
}
