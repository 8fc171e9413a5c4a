// src/engine/sync.rs
//
// Vault Synchronization Engine: walks a vault's flushed cycles in order and,
// for each cycle whose referenced harvest indices have all completed, mints
// vault shares for depositors against the actual post-harvest results and
// resolves withdrawal requests into claimable asset amounts. Cycle n never
// settles before cycle n-1; a cycle whose harvests are still running simply
// stops the walk. Synchronization only applies deltas recorded by harvest
// snapshots, so re-running it is naturally idempotent.

use super::{VaultEntry, VaultEngine, VaultState};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    mul_div, Basket, CycleState, HarvestRecord, RequestId, RequestStatus, StrategyId, VaultId,
    INITIAL_SHARE_MULTIPLIER,
};
use log::{debug, info};
use std::collections::HashMap;

impl VaultEngine {
    /// Synchronizes every settleable cycle of a vault, in order, and returns
    /// the number of fully synchronized cycles. Stops quietly at the first
    /// cycle still waiting on a harvest; redundant calls are harmless.
    pub async fn synchronize(&self, vault_id: VaultId) -> EngineResult<u64> {
        let vault = self.store().vault(vault_id)?;
        let mut vs = vault.state.write().await;
        while vs.synced_index < vs.flush_index {
            let next = vs.synced_index;
            if !self.cycle_ready(&vs, next).await? {
                debug!("{}: cycle {} still waiting on harvests", vault_id, next);
                break;
            }
            self.apply_cycle(vault, &mut vs, next).await?;
        }
        Ok(vs.synced_index)
    }

    /// Synchronizes exactly one cycle by index. Fails with an ordering
    /// violation if the preceding cycle has not been synchronized or the
    /// cycle's harvests have not all completed; already-synchronized cycles
    /// are a no-op.
    pub async fn synchronize_cycle(&self, vault_id: VaultId, index: u64) -> EngineResult<u64> {
        let vault = self.store().vault(vault_id)?;
        let mut vs = vault.state.write().await;
        if index < vs.synced_index {
            return Ok(vs.synced_index);
        }
        if index > vs.synced_index {
            return Err(EngineError::OrderingViolation(format!(
                "{}: cycle {} cannot settle before cycle {}",
                vault_id,
                index,
                vs.synced_index
            )));
        }
        if index >= vs.flush_index {
            return Err(EngineError::OrderingViolation(format!(
                "{}: cycle {} has not been flushed",
                vault_id, index
            )));
        }
        if !self.cycle_ready(&vs, index).await? {
            return Err(EngineError::OrderingViolation(format!(
                "{}: cycle {} references harvests that have not completed",
                vault_id, index
            )));
        }
        self.apply_cycle(vault, &mut vs, index).await?;
        Ok(vs.synced_index)
    }

    /// Claims the vault shares minted for a synchronized deposit request.
    /// Exactly-once: the request moves to `Claimed`.
    pub async fn claim_deposit(
        &self,
        vault_id: VaultId,
        request_id: RequestId,
        owner: &str,
    ) -> EngineResult<u128> {
        let vault = self.store().vault(vault_id)?;
        let mut vs = vault.state.write().await;
        let req = vs
            .deposit_requests
            .get_mut(&request_id)
            .ok_or_else(|| EngineError::UnknownEntity(format!("request {}", request_id)))?;
        if req.owner != owner {
            return Err(EngineError::NotClaimable(format!(
                "request {} is not owned by {}",
                request_id, owner
            )));
        }
        if req.status != RequestStatus::Claimable {
            return Err(EngineError::NotClaimable(format!(
                "request {} is {:?}",
                request_id, req.status
            )));
        }
        let shares = req.claimable_shares.unwrap_or(0);
        req.status = RequestStatus::Claimed;
        *vs.account_shares.entry(owner.to_string()).or_insert(0) += shares;
        Ok(shares)
    }

    /// Claims the asset basket a synchronized withdrawal request resolved
    /// to. Exactly-once.
    pub async fn claim_withdrawal(
        &self,
        vault_id: VaultId,
        request_id: RequestId,
        owner: &str,
    ) -> EngineResult<Basket> {
        let vault = self.store().vault(vault_id)?;
        let mut vs = vault.state.write().await;
        let req = vs
            .withdrawal_requests
            .get_mut(&request_id)
            .ok_or_else(|| EngineError::UnknownEntity(format!("request {}", request_id)))?;
        if req.owner != owner {
            return Err(EngineError::NotClaimable(format!(
                "request {} is not owned by {}",
                request_id, owner
            )));
        }
        if req.status != RequestStatus::Claimable {
            return Err(EngineError::NotClaimable(format!(
                "request {} is {:?}",
                request_id, req.status
            )));
        }
        let basket = req
            .claimable_basket
            .clone()
            .unwrap_or_else(|| Basket::zero(0));
        req.status = RequestStatus::Claimed;
        Ok(basket)
    }

    /// True when every harvest index referenced by the cycle has completed.
    async fn cycle_ready(&self, vs: &VaultState, index: u64) -> EngineResult<bool> {
        let cycle = &vs.cycles[index as usize];
        for route in &cycle.routes {
            let entry = self.store().strategy(route.strategy)?;
            let st = entry.state.read().await;
            if st.next_harvest_index() <= route.harvest_index {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Settles one ready cycle against its harvest records.
    async fn apply_cycle(
        &self,
        vault: &VaultEntry,
        vs: &mut VaultState,
        index: u64,
    ) -> EngineResult<()> {
        let group = self.store().group(vault.group)?;
        let decimals = group.decimals();
        let cycle = vs.cycles[index as usize].clone();

        // Pull the harvest record each route settled at.
        let mut records: HashMap<StrategyId, HarvestRecord> = HashMap::new();
        for route in &cycle.routes {
            let entry = self.store().strategy(route.strategy)?;
            let st = entry.state.read().await;
            records.insert(
                route.strategy,
                st.records[route.harvest_index as usize].clone(),
            );
        }

        // Deposit side: credit the vault its slice of each strategy's mint,
        // valued at the post-harvest share price.
        let mut minted_value: u128 = 0;
        for route in &cycle.routes {
            if route.basket.is_zero() {
                continue;
            }
            let rec = &records[&route.strategy];
            if rec.total_deposit_usd == 0 || rec.shares_minted == 0 {
                continue;
            }
            let route_usd = route.basket.usd_value(&rec.prices, &decimals)?;
            let minted = mul_div(rec.shares_minted, route_usd, rec.total_deposit_usd)?;
            *vs.strategy_shares.entry(route.strategy).or_insert(0) += minted;
            minted_value += rec.shares_to_usd(minted)?;
        }

        // Vault valuation after the mints. Each routed strategy is priced at
        // the harvest record this cycle settled at, even if it has harvested
        // further since, so mint and valuation share one epoch and late
        // synchronization cannot leak post-cycle yield to earlier holders.
        // Strategies with no work this cycle fall back to their latest
        // settled price.
        let mut vault_value: u128 = 0;
        for &sid in &vault.strategies {
            let owned = *vs.strategy_shares.get(&sid).unwrap_or(&0);
            if owned == 0 {
                continue;
            }
            if let Some(rec) = records.get(&sid) {
                vault_value += rec.shares_to_usd(owned)?;
                continue;
            }
            let entry = self.store().strategy(sid)?;
            let st = entry.state.read().await;
            if let Some(rec) = st.records.last() {
                vault_value += rec.shares_to_usd(owned)?;
            }
        }
        let pre_value = vault_value.saturating_sub(minted_value);

        let vault_minted = if minted_value == 0 {
            0
        } else if vs.total_shares == 0 || pre_value == 0 {
            minted_value
                .checked_mul(INITIAL_SHARE_MULTIPLIER)
                .ok_or_else(|| EngineError::Numeric("initial vault mint overflow".to_string()))?
        } else {
            mul_div(vs.total_shares, minted_value, pre_value)?
        };
        vs.total_shares += vault_minted;

        // Split the mint across the cycle's deposit requests, weighted by
        // flush-time value; rounding dust goes to the last request.
        if vault_minted > 0 && !cycle.deposit_request_ids.is_empty() {
            let mut weights = Vec::with_capacity(cycle.deposit_request_ids.len());
            let mut total_weight: u128 = 0;
            for id in &cycle.deposit_request_ids {
                let req = &vs.deposit_requests[id];
                let w = req.basket.usd_value(&cycle.flush_prices, &decimals)?;
                weights.push(w);
                total_weight += w;
            }
            let mut handed_out: u128 = 0;
            let n = cycle.deposit_request_ids.len();
            for (i, id) in cycle.deposit_request_ids.iter().enumerate() {
                let share = if i + 1 == n {
                    vault_minted - handed_out
                } else if total_weight == 0 {
                    0
                } else {
                    mul_div(vault_minted, weights[i], total_weight)?
                };
                handed_out += share;
                let req = vs.deposit_requests.get_mut(id).unwrap();
                req.claimable_shares = Some(share);
                req.status = RequestStatus::Claimable;
            }
        } else {
            for id in &cycle.deposit_request_ids {
                let req = vs.deposit_requests.get_mut(id).unwrap();
                req.claimable_shares = Some(0);
                req.status = RequestStatus::Claimable;
            }
        }

        // Withdrawal side: gather the vault's slice of each strategy's
        // redeemed basket, then split it across withdrawal requests.
        if cycle.withdrawal_shares > 0 {
            let mut pool = Basket::zero(group.asset_count());
            for route in &cycle.routes {
                if route.withdraw_shares == 0 {
                    continue;
                }
                let rec = &records[&route.strategy];
                if rec.shares_burned == 0 {
                    continue;
                }
                for a in 0..pool.len() {
                    pool.amounts[a] +=
                        mul_div(rec.withdrawn.amounts[a], route.withdraw_shares, rec.shares_burned)?;
                }
            }

            let mut handed = Basket::zero(group.asset_count());
            let n = cycle.withdrawal_request_ids.len();
            for (i, id) in cycle.withdrawal_request_ids.iter().enumerate() {
                let req_shares = vs.withdrawal_requests[id].shares;
                let mut basket = Basket::zero(group.asset_count());
                for a in 0..basket.len() {
                    basket.amounts[a] = if i + 1 == n {
                        pool.amounts[a] - handed.amounts[a]
                    } else {
                        mul_div(pool.amounts[a], req_shares, cycle.withdrawal_shares)?
                    };
                }
                handed.add_assign(&basket)?;
                let req = vs.withdrawal_requests.get_mut(id).unwrap();
                req.claimable_basket = Some(basket);
                req.status = RequestStatus::Claimable;
            }
        }

        vs.cycles[index as usize].state = CycleState::Synced;
        vs.synced_index += 1;
        info!(
            "{}: cycle {} synchronized ({} vault shares minted)",
            vault.id, index, vault_minted
        );
        Ok(())
    }
}
