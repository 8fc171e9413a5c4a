// src/traits.rs

use crate::error::EngineResult;
use crate::models::{AllocationVector, Basket, PriceQuote, StrategyId};
use async_trait::async_trait;
use std::sync::Arc;

/// Adapter over one external yield source. One implementation per protocol;
/// the engine only ever sees this interface, so strategies are swappable
/// without touching flush/harvest/sync code.
///
/// Share amounts returned by `deposit` and consumed by `redeem` are the
/// *underlying source's* receipt units. The engine tracks them verbatim and
/// never interprets them beyond pro-rata arithmetic.
#[async_trait]
pub trait StrategyAdapter: Send + Sync {
    /// Returns the name of this adapter (for logging).
    fn name(&self) -> &str;

    /// Required per-asset deposit ratio, positional against the asset group.
    /// Arbitrary scale; only the proportions matter. May change over time.
    async fn asset_ratio(&self) -> EngineResult<Vec<u128>>;

    /// Invests a ratio-conformant basket, returning the underlying shares
    /// issued by the yield source.
    async fn deposit(&self, basket: &Basket) -> EngineResult<u128>;

    /// Redeems underlying shares back into assets.
    async fn redeem(&self, shares: u128) -> EngineResult<Basket>;

    /// Current USD (8 decimals) valuation of everything this adapter holds,
    /// at the given per-asset prices.
    async fn current_valuation(&self, prices: &[u128]) -> EngineResult<u128>;

    /// Settles yield accrued since the previous harvest and returns it as a
    /// signed percentage in parts per [`crate::models::YIELD_PRECISION`].
    async fn harvest(&self) -> EngineResult<i128>;
}

/// Price oracle for asset-to-USD exchange rates. Quotes carry their
/// acquisition timestamp; the engine enforces the staleness bound and fails
/// operations on old or missing rates rather than defaulting.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn exchange_rate(&self, symbol: &str) -> EngineResult<PriceQuote>;
}

/// Strategy-selection policy: maps per-strategy risk scores and recent
/// yields to a target allocation vector. Pure and deterministic.
pub trait AllocationProvider: Send + Sync {
    /// Returns the name of this provider (for logging).
    fn name(&self) -> &str;

    /// Computes a target allocation summing to exactly
    /// [`crate::models::FULL_ALLOCATION`].
    ///
    /// # Arguments
    /// * `strategies` - Strategy ids, positional with the other slices
    /// * `risk_scores` - Per-strategy risk, 0 (safest) to 100 (riskiest)
    /// * `yields` - Per-strategy recent yield, parts per 10^12
    /// * `risk_tolerance` - Caller appetite, -10 (averse) to 10 (seeking)
    fn compute_allocation(
        &self,
        strategies: &[StrategyId],
        risk_scores: &[u8],
        yields: &[i128],
        risk_tolerance: i8,
    ) -> EngineResult<AllocationVector>;
}

/// Shared handle types so one adapter/oracle instance can serve many vaults.
pub type SharedStrategyAdapter = Arc<dyn StrategyAdapter>;
pub type SharedPriceOracle = Arc<dyn PriceOracle>;
pub type SharedAllocationProvider = Arc<dyn AllocationProvider>;
