// src/engine/reallocate.rs
//
// Reallocation Engine: moves already-invested capital between strategies
// when a vault's target allocation changes, without a withdraw-then-deposit
// round trip through end users. Over-allocated strategies are partially
// redeemed; the pooled basket is re-divided across under-allocated
// strategies through the ratio divider, weighted by their deficits. It never
// touches in-flight flush cycles: every flushed cycle must be synchronized
// before capital moves. An aborted pass parks any redeemed but not yet
// re-placed assets in the vault's out-of-band claims, so no ledger ever
// loses them.

use super::{VaultEngine, VaultEntry, VaultState};
use crate::allocation::normalize_weights;
use crate::divider::{divide_deposit, DivisionInput};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    mul_div, AllocationVector, Basket, ReallocationRecord, StrategyId, StrategyStatus, VaultId,
    FULL_ALLOCATION, INITIAL_SHARE_MULTIPLIER,
};
use chrono::Utc;
use log::{info, warn};

impl VaultEngine {
    /// Applies a new target allocation to a vault, migrating harvested
    /// capital toward it, and returns the allocation now in force.
    /// Repeated calls with the same target converge on it to within
    /// rounding dust.
    pub async fn reallocate(
        &self,
        vault_id: VaultId,
        new_allocation: AllocationVector,
    ) -> EngineResult<AllocationVector> {
        let vault = self.store().vault(vault_id)?;
        let group = self.store().group(vault.group)?;
        new_allocation.validate(vault.strategies.len())?;

        let mut vs = vault.state.write().await;
        if vs.synced_index < vs.flush_index {
            return Err(EngineError::OrderingViolation(format!(
                "{}: {} flushed cycles await synchronization before reallocating",
                vault_id,
                vs.flush_index - vs.synced_index
            )));
        }

        let prices = self.fetch_prices(group).await?;
        let decimals = group.decimals();
        let n = vault.strategies.len();

        // Snapshot per-strategy liveness, ratio and the vault's slice of
        // each strategy's live valuation.
        let mut live = vec![false; n];
        let mut ratios: Vec<Vec<u128>> = Vec::with_capacity(n);
        let mut values = vec![0u128; n];
        for (i, &sid) in vault.strategies.iter().enumerate() {
            let entry = self.store().strategy(sid)?;
            let st = entry.state.read().await;
            live[i] = st.status == StrategyStatus::Live;
            let owned = *vs.strategy_shares.get(&sid).unwrap_or(&0);
            if owned > 0 && st.total_shares > 0 {
                let value = entry.adapter.current_valuation(&prices).await?;
                values[i] = mul_div(owned, value, st.total_shares)?;
            }
            drop(st);
            ratios.push(entry.adapter.asset_ratio().await?);
            if !live[i] && new_allocation.weights[i] > 0 {
                return Err(EngineError::Configuration(format!(
                    "{} is decommissioned and cannot receive allocation",
                    sid
                )));
            }
        }

        let total: u128 = values.iter().sum();
        if total == 0 {
            // Nothing invested yet; the new target simply takes effect.
            vs.allocation = new_allocation.clone();
            return Ok(new_allocation);
        }

        let mut targets = vec![0u128; n];
        for i in 0..n {
            targets[i] = mul_div(
                total,
                new_allocation.weights[i] as u128,
                FULL_ALLOCATION as u128,
            )?;
        }

        // From here on `pool` tracks redeemed assets that have not landed in
        // a strategy yet. Any failure parks the pool instead of dropping it.
        let mut pool = Basket::zero(group.asset_count());
        let mut moved_usd: u128 = 0;
        let mut harvest_indices: Vec<(StrategyId, u64)> = Vec::new();
        if let Err(e) = self
            .drain_over_allocated(
                vault,
                &mut vs,
                &values,
                &targets,
                &mut pool,
                &mut moved_usd,
                &mut harvest_indices,
            )
            .await
        {
            return Err(Self::park_pool(vault_id, &mut vs, &pool, e));
        }

        if !pool.is_zero() {
            if let Err(e) = self
                .place_under_allocated(
                    vault,
                    &mut vs,
                    &prices,
                    &decimals,
                    &ratios,
                    &values,
                    &targets,
                    &new_allocation,
                    &mut pool,
                    &mut harvest_indices,
                )
                .await
            {
                return Err(Self::park_pool(vault_id, &mut vs, &pool, e));
            }
        }

        vs.allocation = new_allocation.clone();
        vs.reallocations.push(ReallocationRecord {
            timestamp: Utc::now().timestamp(),
            harvest_indices,
            moved_usd,
            new_allocation: new_allocation.clone(),
        });
        info!(
            "{}: reallocated, moved {} USD-units across strategies",
            vault_id, moved_usd
        );
        Ok(new_allocation)
    }

    /// Redeems the excess out of over-allocated strategies into `pool`.
    /// Strategy share burns commit per strategy, in step with the assets the
    /// adapter actually returned.
    #[allow(clippy::too_many_arguments)]
    async fn drain_over_allocated(
        &self,
        vault: &VaultEntry,
        vs: &mut VaultState,
        values: &[u128],
        targets: &[u128],
        pool: &mut Basket,
        moved_usd: &mut u128,
        harvest_indices: &mut Vec<(StrategyId, u64)>,
    ) -> EngineResult<()> {
        for (i, &sid) in vault.strategies.iter().enumerate() {
            if values[i] <= targets[i] {
                continue;
            }
            let excess = values[i] - targets[i];
            let entry = self.store().strategy(sid)?;
            let mut st = entry.state.write().await;
            let owned = *vs.strategy_shares.get(&sid).unwrap_or(&0);
            let burn = mul_div(owned, excess, values[i])?;
            if burn == 0 {
                continue;
            }
            let underlying = mul_div(st.underlying_shares, burn, st.total_shares)?;
            let redeemed = entry.adapter.redeem(underlying).await?;
            st.underlying_shares -= underlying;
            st.total_shares -= burn;
            harvest_indices.push((sid, st.next_harvest_index()));
            drop(st);
            *vs.strategy_shares.get_mut(&sid).unwrap() -= burn;
            pool.add_assign(&redeemed)?;
            *moved_usd += excess;
        }
        Ok(())
    }

    /// Splits `pool` across under-allocated strategies, weighted by how far
    /// below target each one sits, and deposits the sub-baskets. Each
    /// sub-basket leaves `pool` only once its adapter accepted it, so on
    /// failure `pool` holds exactly the unplaced remainder.
    #[allow(clippy::too_many_arguments)]
    async fn place_under_allocated(
        &self,
        vault: &VaultEntry,
        vs: &mut VaultState,
        prices: &[u128],
        decimals: &[u8],
        ratios: &[Vec<u128>],
        values: &[u128],
        targets: &[u128],
        fallback: &AllocationVector,
        pool: &mut Basket,
        harvest_indices: &mut Vec<(StrategyId, u64)>,
    ) -> EngineResult<()> {
        let n = vault.strategies.len();
        let deficits: Vec<u128> = (0..n)
            .map(|i| targets[i].saturating_sub(values[i]))
            .collect();
        let weights = if deficits.iter().any(|&d| d > 0) {
            normalize_weights(&deficits)?
        } else {
            fallback.clone()
        };
        let input = DivisionInput {
            basket: &*pool,
            allocation: &weights,
            ratios,
            prices,
            decimals,
        };
        let sub_baskets = divide_deposit(&input)?;

        for (i, &sid) in vault.strategies.iter().enumerate() {
            let sub = &sub_baskets[i];
            if sub.is_zero() {
                continue;
            }
            let entry = self.store().strategy(sid)?;
            let mut st = entry.state.write().await;
            // Mint amount is settled before the adapter call, so the deposit
            // is the last fallible step for this strategy.
            let value_before = entry.adapter.current_valuation(prices).await?;
            let sub_usd = sub.usd_value(prices, decimals)?;
            let minted = if st.total_shares == 0 || value_before == 0 {
                sub_usd
                    .checked_mul(INITIAL_SHARE_MULTIPLIER)
                    .ok_or_else(|| EngineError::Numeric("initial mint overflow".to_string()))?
            } else {
                mul_div(st.total_shares, sub_usd, value_before)?
            };
            let issued = entry.adapter.deposit(sub).await?;
            st.total_shares += minted;
            st.underlying_shares += issued;
            if !harvest_indices.iter().any(|(s, _)| *s == sid) {
                harvest_indices.push((sid, st.next_harvest_index()));
            }
            drop(st);
            *vs.strategy_shares.entry(sid).or_insert(0) += minted;
            *pool = pool.checked_sub(sub)?;
        }
        Ok(())
    }

    /// Credits assets an aborted pass could not re-place to the vault's
    /// out-of-band claims, then hands the original error back.
    fn park_pool(
        vault_id: VaultId,
        vs: &mut VaultState,
        pool: &Basket,
        e: EngineError,
    ) -> EngineError {
        if !pool.is_zero() {
            for (a, &amount) in pool.amounts.iter().enumerate() {
                vs.emergency_claims.amounts[a] += amount;
            }
            warn!(
                "{}: reallocation aborted ({}); {:?} parked for out-of-band distribution",
                vault_id, e, pool.amounts
            );
        }
        e
    }
}
