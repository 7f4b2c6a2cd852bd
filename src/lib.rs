//! Gasless-transaction relay for an EVM-compatible chain.
//!
//! Agents hold stablecoin but no native gas token. They sign an EIP-712
//! `ForwardRequest` envelope and POST it to this relay; the relay answers
//! the first attempt with `402 Payment Required` carrying structured terms,
//! the client retries with an EIP-3009 `transferWithAuthorization` in the
//! `X-Payment` header, and the relay settles the stablecoin payment
//! on-chain before executing the forwarded call through a pool of funded
//! gas wallets.
//!
//! # Modules
//!
//! - [`chain`] — Typed JSON-RPC boundary: provider stack, contract
//!   bindings, nonce discipline, error classification.
//! - [`config`] — Startup configuration from CLI flags and environment.
//! - [`relayer`] — The gas wallet pool: selection, accounting, resync.
//! - [`pricing`] — Priority tiers, the native/USD oracle, and quotes.
//! - [`forwarder`] — EIP-712 domain plus verify/execute against the
//!   on-chain forwarder.
//! - [`payment`] — `X-Payment` parsing, verification, and settlement.
//! - [`relay`] — The request pipeline tying the services together.
//! - [`handlers`] — Axum routes.
//! - [`rate_limit`] — Fixed-window limiter.
//! - [`error`] — The HTTP error taxonomy.
//! - [`stats`] — In-memory counters and transaction records.
//! - [`rebalance`] — Periodic stablecoin → native swaps for gas funding.
//! - [`telemetry`] — Tracing and optional OTLP export.
//! - [`types`] — Wire types; integers travel as decimal strings.
//! - [`timestamp`] — Unix-seconds wire type shared by envelopes and quotes.

pub mod chain;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod payment;
pub mod pricing;
pub mod rate_limit;
pub mod rebalance;
pub mod relay;
pub mod relayer;
pub mod stats;
pub mod telemetry;
pub mod timestamp;
pub mod types;
