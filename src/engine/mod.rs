// src/engine/mod.rs
//
// The orchestrator: an injected, lifecycle-scoped store of asset groups,
// strategies and vaults, plus the batch operations that move capital between
// them. Vaults and strategies cross-reference each other only through
// arena-style ids; each carries its own lock so harvests on different
// strategies and syncs on different vaults run independently.

mod flush;
mod harvest;
mod reallocate;
mod sync;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    mul_div, AccountId, AllocationVector, Asset, AssetGroup, AssetGroupId, Basket,
    DepositRequest, FlushCycle, HarvestRecord, ReallocationRecord, RequestId, StrategyId,
    StrategyStatus, VaultId, WithdrawalRequest,
};
use crate::traits::{AllocationProvider, SharedPriceOracle, SharedStrategyAdapter};
use chrono::Utc;
use log::info;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables shared by every operation of one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Oracle quotes older than this abort the operation with `StaleData`.
    pub max_price_age_secs: i64,
    /// Fee on positive yield, minted as strategy shares to the ecosystem.
    pub ecosystem_fee_bps: u64,
    /// Fee on positive yield, minted as strategy shares to the treasury.
    pub treasury_fee_bps: u64,
    /// Maximum per-asset deviation (bps of total value) between the flushed
    /// basket's composition and the aggregate ideal before the slippage
    /// guard aborts the flush. 10_000 disables the guard.
    pub flush_ratio_guard_bps: u64,
    /// Consecutive harvest failures before a strategy is decommissioned.
    pub max_adapter_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_price_age_secs: 3600,
            ecosystem_fee_bps: 500,
            treasury_fee_bps: 300,
            flush_ratio_guard_bps: 10_000,
            max_adapter_failures: 3,
        }
    }
}

// =============================================================================
// Strategy and Vault Entries
// =============================================================================

/// Work routed to a strategy by a vault flush, waiting for the next harvest.
#[derive(Clone, Debug)]
pub struct PendingHarvest {
    pub vault: VaultId,
    pub flush_index: u64,
    pub deposit: Basket,
    pub withdraw_shares: u128,
    /// The harvest index this work will settle at.
    pub at_index: u64,
}

/// Mutable state of one strategy, guarded by its own lock.
#[derive(Debug)]
pub struct StrategyState {
    pub status: StrategyStatus,
    /// Engine-level strategy shares (vault ownership units).
    pub total_shares: u128,
    /// Portion of `total_shares` minted as yield fees.
    pub fee_shares: u128,
    /// Receipt shares held at the underlying yield source.
    pub underlying_shares: u128,
    /// Completed harvests; `records[i]` is harvest index `i`.
    pub records: Vec<HarvestRecord>,
    /// Flushed work not yet harvested, FIFO.
    pub pending: Vec<PendingHarvest>,
    pub consecutive_failures: u32,
    pub cumulative_yield_ppt: i128,
    /// Yield the adapter already settled on attempts that failed later in
    /// the step; folded into the record when the index finally commits.
    pub carried_yield_ppt: i128,
}

impl StrategyState {
    fn new() -> Self {
        Self {
            status: StrategyStatus::Live,
            total_shares: 0,
            fee_shares: 0,
            underlying_shares: 0,
            records: Vec::new(),
            pending: Vec::new(),
            consecutive_failures: 0,
            cumulative_yield_ppt: 0,
            carried_yield_ppt: 0,
        }
    }

    /// The next harvest index to complete (== completed harvest count).
    pub fn next_harvest_index(&self) -> u64 {
        self.records.len() as u64
    }
}

/// One registered strategy: static attributes plus locked mutable state.
pub struct StrategyEntry {
    pub id: StrategyId,
    pub name: String,
    pub group: AssetGroupId,
    pub risk_score: u8,
    pub adapter: SharedStrategyAdapter,
    pub state: RwLock<StrategyState>,
}

/// Mutable state of one vault, guarded by its own lock.
#[derive(Debug)]
pub struct VaultState {
    pub allocation: AllocationVector,
    /// Vault share supply.
    pub total_shares: u128,
    /// Strategy shares the vault owns, per strategy.
    pub strategy_shares: HashMap<StrategyId, u128>,
    /// Vault shares per account.
    pub account_shares: HashMap<AccountId, u128>,
    /// Cycle currently accepting requests, created lazily.
    pub open_cycle: Option<FlushCycle>,
    /// Flushed cycles; position == flush index.
    pub cycles: Vec<FlushCycle>,
    /// Count of flushed cycles (the vault's flush index).
    pub flush_index: u64,
    /// Count of fully synchronized cycles.
    pub synced_index: u64,
    pub deposit_requests: HashMap<RequestId, DepositRequest>,
    pub withdrawal_requests: HashMap<RequestId, WithdrawalRequest>,
    /// Assets returned by emergency withdrawals, held for out-of-band
    /// distribution.
    pub emergency_claims: Basket,
    pub reallocations: Vec<ReallocationRecord>,
}

/// One registered vault.
pub struct VaultEntry {
    pub id: VaultId,
    pub name: String,
    pub group: AssetGroupId,
    /// Participating strategies, positional with the allocation vector.
    pub strategies: Vec<StrategyId>,
    pub state: RwLock<VaultState>,
}

// =============================================================================
// Store and Builder
// =============================================================================

/// The registry of groups, strategies and vaults. Constructed once through
/// [`EngineBuilder`] and owned by the engine; append-only by design, so
/// multiple engine instances stay fully isolated.
pub struct EngineStore {
    pub groups: Vec<AssetGroup>,
    pub strategies: Vec<Arc<StrategyEntry>>,
    pub vaults: Vec<Arc<VaultEntry>>,
}

impl EngineStore {
    pub fn group(&self, id: AssetGroupId) -> EngineResult<&AssetGroup> {
        self.groups
            .get(id.0 as usize)
            .ok_or_else(|| EngineError::UnknownEntity(format!("asset group {}", id.0)))
    }

    pub fn strategy(&self, id: StrategyId) -> EngineResult<&Arc<StrategyEntry>> {
        self.strategies
            .get(id.0 as usize)
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))
    }

    pub fn vault(&self, id: VaultId) -> EngineResult<&Arc<VaultEntry>> {
        self.vaults
            .get(id.0 as usize)
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))
    }
}

/// Builder for a [`VaultEngine`]: register asset groups, then strategies,
/// then vaults over them.
pub struct EngineBuilder {
    groups: Vec<AssetGroup>,
    strategies: Vec<Arc<StrategyEntry>>,
    vaults: Vec<Arc<VaultEntry>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            strategies: Vec::new(),
            vaults: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an asset group and returns its id.
    pub fn add_asset_group(&mut self, name: impl Into<String>, assets: Vec<Asset>) -> EngineResult<AssetGroupId> {
        if assets.is_empty() {
            return Err(EngineError::Configuration("asset group has no assets".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for asset in &assets {
            if !seen.insert(asset.symbol.clone()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate asset {} in group",
                    asset.symbol
                )));
            }
        }
        let id = AssetGroupId(self.groups.len() as u32);
        self.groups.push(AssetGroup {
            id,
            name: name.into(),
            assets,
        });
        Ok(id)
    }

    /// Registers a strategy over an existing asset group.
    pub fn add_strategy(
        &mut self,
        name: impl Into<String>,
        group: AssetGroupId,
        adapter: SharedStrategyAdapter,
        risk_score: u8,
    ) -> EngineResult<StrategyId> {
        if self.groups.get(group.0 as usize).is_none() {
            return Err(EngineError::UnknownEntity(format!("asset group {}", group.0)));
        }
        if risk_score > 100 {
            return Err(EngineError::Configuration(format!(
                "risk score {} outside 0..=100",
                risk_score
            )));
        }
        let id = StrategyId(self.strategies.len() as u32);
        self.strategies.push(Arc::new(StrategyEntry {
            id,
            name: name.into(),
            group,
            risk_score,
            adapter,
            state: RwLock::new(StrategyState::new()),
        }));
        Ok(id)
    }

    /// Registers a vault over existing strategies of the same asset group.
    pub fn add_vault(
        &mut self,
        name: impl Into<String>,
        group: AssetGroupId,
        strategies: Vec<StrategyId>,
        allocation: AllocationVector,
    ) -> EngineResult<VaultId> {
        let group_entry = self
            .groups
            .get(group.0 as usize)
            .ok_or_else(|| EngineError::UnknownEntity(format!("asset group {}", group.0)))?;
        if strategies.is_empty() {
            return Err(EngineError::Configuration("vault has no strategies".to_string()));
        }
        allocation.validate(strategies.len())?;
        for &sid in &strategies {
            let entry = self
                .strategies
                .get(sid.0 as usize)
                .ok_or_else(|| EngineError::UnknownEntity(sid.to_string()))?;
            if entry.group != group {
                return Err(EngineError::Configuration(format!(
                    "{} uses a different asset group than the vault",
                    sid
                )));
            }
        }
        let id = VaultId(self.vaults.len() as u32);
        let asset_count = group_entry.asset_count();
        let strategy_shares = strategies.iter().map(|&s| (s, 0u128)).collect();
        self.vaults.push(Arc::new(VaultEntry {
            id,
            name: name.into(),
            group,
            strategies,
            state: RwLock::new(VaultState {
                allocation,
                total_shares: 0,
                strategy_shares,
                account_shares: HashMap::new(),
                open_cycle: None,
                cycles: Vec::new(),
                flush_index: 0,
                synced_index: 0,
                deposit_requests: HashMap::new(),
                withdrawal_requests: HashMap::new(),
                emergency_claims: Basket::zero(asset_count),
                reallocations: Vec::new(),
            }),
        }));
        Ok(id)
    }

    /// Finalizes the registry into a running engine.
    pub fn build(self, oracle: SharedPriceOracle) -> VaultEngine {
        info!(
            "engine built: {} asset groups, {} strategies, {} vaults",
            self.groups.len(),
            self.strategies.len(),
            self.vaults.len()
        );
        VaultEngine {
            store: EngineStore {
                groups: self.groups,
                strategies: self.strategies,
                vaults: self.vaults,
            },
            oracle,
            config: self.config,
            next_request_id: AtomicU64::new(1),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// The Engine
// =============================================================================

/// The batching, harvest-settlement and allocation engine. All operations
/// are short, finite, retryable batch steps; none suspends open-ended.
pub struct VaultEngine {
    store: EngineStore,
    oracle: SharedPriceOracle,
    config: EngineConfig,
    next_request_id: AtomicU64,
}

impl VaultEngine {
    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn allot_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetches per-asset prices for a group, failing on missing or stale
    /// quotes rather than defaulting.
    pub(crate) async fn fetch_prices(&self, group: &AssetGroup) -> EngineResult<Vec<u128>> {
        let now = Utc::now().timestamp();
        let mut prices = Vec::with_capacity(group.asset_count());
        for asset in &group.assets {
            let quote = self.oracle.exchange_rate(&asset.symbol).await?;
            let age = now - quote.timestamp;
            if age > self.config.max_price_age_secs {
                return Err(EngineError::StaleData {
                    asset: asset.symbol.clone(),
                    detail: format!(
                        "quote is {}s old, bound is {}s",
                        age, self.config.max_price_age_secs
                    ),
                });
            }
            prices.push(quote.price);
        }
        Ok(prices)
    }

    /// Current USD value of a vault: its pro-rata slice of every strategy's
    /// live valuation.
    pub async fn vault_value(&self, vault_id: VaultId) -> EngineResult<u128> {
        let vault = self.store.vault(vault_id)?;
        let group = self.store.group(vault.group)?;
        let prices = self.fetch_prices(group).await?;
        let vs = vault.state.read().await;
        let mut total: u128 = 0;
        for &sid in &vault.strategies {
            let owned = *vs.strategy_shares.get(&sid).unwrap_or(&0);
            if owned == 0 {
                continue;
            }
            let entry = self.store.strategy(sid)?;
            let st = entry.state.read().await;
            if st.total_shares == 0 {
                continue;
            }
            let value = entry.adapter.current_valuation(&prices).await?;
            total += mul_div(owned, value, st.total_shares)?;
        }
        Ok(total)
    }

    /// Vault shares held by an account.
    pub async fn account_shares(&self, vault_id: VaultId, owner: &str) -> EngineResult<u128> {
        let vault = self.store.vault(vault_id)?;
        let vs = vault.state.read().await;
        Ok(*vs.account_shares.get(owner).unwrap_or(&0))
    }

    /// Runs an allocation provider over a vault's strategies, feeding it the
    /// registered risk scores and each strategy's most recent measured yield.
    pub async fn suggest_allocation(
        &self,
        vault_id: VaultId,
        provider: &dyn AllocationProvider,
        risk_tolerance: i8,
    ) -> EngineResult<AllocationVector> {
        let vault = self.store.vault(vault_id)?;
        let mut risk_scores = Vec::with_capacity(vault.strategies.len());
        let mut yields = Vec::with_capacity(vault.strategies.len());
        for &sid in &vault.strategies {
            let entry = self.store.strategy(sid)?;
            risk_scores.push(entry.risk_score);
            let st = entry.state.read().await;
            yields.push(st.records.last().map(|r| r.yield_ppt).unwrap_or(0));
        }
        provider.compute_allocation(&vault.strategies, &risk_scores, &yields, risk_tolerance)
    }
}
