// src/engine/flush.rs
//
// Flush Coordinator: accumulates deposit/withdrawal requests against the
// vault's open cycle and, on flush, closes the cycle, divides its baskets
// across strategies and records the harvest index each strategy will reach
// when it processes the cycle. Flushing is permissionless; nothing here
// calls into an external yield source, so a flush is a pure state commit.

use super::VaultEngine;
use crate::allocation::normalize_weights;
use crate::divider::{divide_deposit, ideal_division, DivisionInput};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    mul_div, usd_value, AccountId, Basket, CycleState, DepositRequest, FlushCycle, RequestId,
    RequestStatus, StrategyRoute, StrategyStatus, VaultId, WithdrawalRequest, FULL_ALLOCATION,
};
use log::{debug, info};

impl VaultEngine {
    /// Queues a deposit basket against the vault's open cycle. The request
    /// may be cancelled until the cycle flushes.
    pub async fn request_deposit(
        &self,
        vault_id: VaultId,
        owner: impl Into<AccountId>,
        basket: Basket,
    ) -> EngineResult<RequestId> {
        let vault = self.store().vault(vault_id)?;
        let group = self.store().group(vault.group)?;
        if basket.len() != group.asset_count() {
            return Err(EngineError::Configuration(format!(
                "deposit basket has {} assets, group {} has {}",
                basket.len(),
                group.name,
                group.asset_count()
            )));
        }
        if basket.is_zero() {
            return Err(EngineError::Configuration("empty deposit basket".to_string()));
        }

        let mut vs = vault.state.write().await;
        let flush_index = vs.flush_index;
        let asset_count = group.asset_count();
        let cycle = vs
            .open_cycle
            .get_or_insert_with(|| FlushCycle::open(flush_index, asset_count));
        cycle.deposits.add_assign(&basket)?;

        let id = self.allot_request_id();
        cycle.deposit_request_ids.push(id);
        let cycle_index = cycle.index;
        vs.deposit_requests.insert(
            id,
            DepositRequest {
                id,
                owner: owner.into(),
                vault: vault_id,
                basket,
                flush_index: cycle_index,
                status: RequestStatus::Queued,
                claimable_shares: None,
            },
        );
        debug!("{}: deposit request {} queued on cycle {}", vault_id, id, cycle_index);
        Ok(id)
    }

    /// Queues a withdrawal of vault shares against the open cycle. The
    /// shares are escrowed immediately so they cannot be double-spent.
    pub async fn request_withdrawal(
        &self,
        vault_id: VaultId,
        owner: impl Into<AccountId>,
        shares: u128,
    ) -> EngineResult<RequestId> {
        if shares == 0 {
            return Err(EngineError::Configuration("zero-share withdrawal".to_string()));
        }
        let vault = self.store().vault(vault_id)?;
        let group = self.store().group(vault.group)?;
        let owner = owner.into();

        let mut vs = vault.state.write().await;
        let balance = *vs.account_shares.get(&owner).unwrap_or(&0);
        if shares > balance {
            return Err(EngineError::Configuration(format!(
                "{} holds {} shares, tried to withdraw {}",
                owner, balance, shares
            )));
        }
        *vs.account_shares.get_mut(&owner).unwrap() -= shares;

        let flush_index = vs.flush_index;
        let asset_count = group.asset_count();
        let cycle = vs
            .open_cycle
            .get_or_insert_with(|| FlushCycle::open(flush_index, asset_count));
        cycle.withdrawal_shares += shares;

        let id = self.allot_request_id();
        cycle.withdrawal_request_ids.push(id);
        let cycle_index = cycle.index;
        vs.withdrawal_requests.insert(
            id,
            WithdrawalRequest {
                id,
                owner,
                vault: vault_id,
                shares,
                flush_index: cycle_index,
                status: RequestStatus::Queued,
                claimable_basket: None,
            },
        );
        debug!("{}: withdrawal request {} queued on cycle {}", vault_id, id, cycle_index);
        Ok(id)
    }

    /// Cancels a queued request. Once its cycle has flushed the request is
    /// immutable and must run to completion.
    pub async fn cancel_request(
        &self,
        vault_id: VaultId,
        request_id: RequestId,
        owner: &str,
    ) -> EngineResult<()> {
        let vault = self.store().vault(vault_id)?;
        let mut vs = vault.state.write().await;

        if let Some(req) = vs.deposit_requests.get(&request_id).cloned() {
            if req.owner != owner {
                return Err(EngineError::NotClaimable(format!(
                    "request {} is not owned by {}",
                    request_id, owner
                )));
            }
            if req.status != RequestStatus::Queued {
                return Err(EngineError::OrderingViolation(format!(
                    "request {} already flushed",
                    request_id
                )));
            }
            let cycle = vs.open_cycle.as_mut().expect("queued request implies open cycle");
            cycle.deposits = cycle.deposits.checked_sub(&req.basket)?;
            cycle.deposit_request_ids.retain(|&id| id != request_id);
            vs.deposit_requests.get_mut(&request_id).unwrap().status = RequestStatus::Cancelled;
            return Ok(());
        }

        if let Some(req) = vs.withdrawal_requests.get(&request_id).cloned() {
            if req.owner != owner {
                return Err(EngineError::NotClaimable(format!(
                    "request {} is not owned by {}",
                    request_id, owner
                )));
            }
            if req.status != RequestStatus::Queued {
                return Err(EngineError::OrderingViolation(format!(
                    "request {} already flushed",
                    request_id
                )));
            }
            let cycle = vs.open_cycle.as_mut().expect("queued request implies open cycle");
            cycle.withdrawal_shares -= req.shares;
            cycle.withdrawal_request_ids.retain(|&id| id != request_id);
            *vs.account_shares.entry(req.owner.clone()).or_insert(0) += req.shares;
            vs.withdrawal_requests.get_mut(&request_id).unwrap().status = RequestStatus::Cancelled;
            return Ok(());
        }

        Err(EngineError::UnknownEntity(format!("request {}", request_id)))
    }

    /// Closes the open cycle, divides its deposits across live strategies
    /// and earmarks withdrawal shares, advancing the vault's flush index.
    /// Calling with nothing queued is a no-op returning the current index.
    pub async fn flush(&self, vault_id: VaultId) -> EngineResult<u64> {
        let vault = self.store().vault(vault_id)?;
        let group = self.store().group(vault.group)?;

        let mut vs = vault.state.write().await;
        let mut cycle = match vs.open_cycle.take() {
            Some(c) => c,
            None => return Ok(vs.flush_index),
        };

        // Everything cancelled: flush an empty cycle so ordering never
        // skips an index, but route no work.
        let idle = cycle.deposits.is_zero() && cycle.withdrawal_shares == 0;

        let prices = match self.fetch_prices(group).await {
            Ok(p) => p,
            Err(e) => {
                // Abort with no state change: reopen the cycle.
                vs.open_cycle = Some(cycle);
                return Err(e);
            }
        };
        let decimals = group.decimals();

        // Snapshot ratio and liveness per strategy under short read locks.
        let mut ratios: Vec<Vec<u128>> = Vec::with_capacity(vault.strategies.len());
        let mut live = Vec::with_capacity(vault.strategies.len());
        for &sid in &vault.strategies {
            let entry = self.store().strategy(sid)?;
            let st = entry.state.read().await;
            live.push(st.status == StrategyStatus::Live);
            drop(st);
            match entry.adapter.asset_ratio().await {
                Ok(r) => ratios.push(r),
                Err(e) => {
                    vs.open_cycle = Some(cycle);
                    return Err(e);
                }
            }
        }

        let mut routes: Vec<StrategyRoute> = Vec::new();
        if !idle {
            // Renormalize the target allocation over live strategies only.
            let raw: Vec<u128> = vs
                .allocation
                .weights
                .iter()
                .zip(&live)
                .map(|(&w, &is_live)| if is_live { w as u128 } else { 0 })
                .collect();
            let live_allocation = match normalize_weights(&raw) {
                Ok(a) => a,
                Err(_) => {
                    vs.open_cycle = Some(cycle);
                    return Err(EngineError::Configuration(format!(
                        "{}: no live strategies to flush into",
                        vault_id
                    )));
                }
            };

            // Divide the deposit basket.
            let sub_baskets = if cycle.deposits.is_zero() {
                vec![Basket::zero(group.asset_count()); vault.strategies.len()]
            } else {
                let input = DivisionInput {
                    basket: &cycle.deposits,
                    allocation: &live_allocation,
                    ratios: &ratios,
                    prices: &prices,
                    decimals: &decimals,
                };
                match self.check_ratio_guard(&input) {
                    Ok(()) => {}
                    Err(e) => {
                        vs.open_cycle = Some(cycle);
                        return Err(e);
                    }
                }
                match divide_deposit(&input) {
                    Ok(s) => s,
                    Err(e) => {
                        vs.open_cycle = Some(cycle);
                        return Err(e);
                    }
                }
            };

            // Earmark strategy shares for the withdrawal total. The burn is
            // pro-rata over the vault's current holdings in live strategies.
            let supply = vs.total_shares;
            let mut burns = vec![0u128; vault.strategies.len()];
            if cycle.withdrawal_shares > 0 {
                for (i, &sid) in vault.strategies.iter().enumerate() {
                    if !live[i] {
                        continue;
                    }
                    let owned = *vs.strategy_shares.get(&sid).unwrap_or(&0);
                    if owned == 0 {
                        continue;
                    }
                    burns[i] = mul_div(owned, cycle.withdrawal_shares, supply)?;
                    *vs.strategy_shares.get_mut(&sid).unwrap() -= burns[i];
                }
                vs.total_shares -= cycle.withdrawal_shares;
            }

            // Route work to each strategy that received any.
            for (i, &sid) in vault.strategies.iter().enumerate() {
                let basket = sub_baskets[i].clone();
                if basket.is_zero() && burns[i] == 0 {
                    continue;
                }
                let entry = self.store().strategy(sid)?;
                let mut st = entry.state.write().await;
                let at_index = st.next_harvest_index();
                st.pending.push(super::PendingHarvest {
                    vault: vault_id,
                    flush_index: cycle.index,
                    deposit: basket.clone(),
                    withdraw_shares: burns[i],
                    at_index,
                });
                routes.push(StrategyRoute {
                    strategy: sid,
                    basket,
                    withdraw_shares: burns[i],
                    harvest_index: at_index,
                });
            }
        }

        for &id in &cycle.deposit_request_ids {
            if let Some(req) = vs.deposit_requests.get_mut(&id) {
                req.status = RequestStatus::Flushed;
            }
        }
        for &id in &cycle.withdrawal_request_ids {
            if let Some(req) = vs.withdrawal_requests.get_mut(&id) {
                req.status = RequestStatus::Flushed;
            }
        }

        cycle.state = CycleState::Flushed;
        cycle.flush_prices = prices;
        cycle.routes = routes;
        info!(
            "{}: flushed cycle {} ({} deposit / {} withdrawal requests, {} routes)",
            vault_id,
            cycle.index,
            cycle.deposit_request_ids.len(),
            cycle.withdrawal_request_ids.len(),
            cycle.routes.len()
        );
        vs.cycles.push(cycle);
        vs.flush_index += 1;
        Ok(vs.flush_index)
    }

    /// Aborts the flush if the basket's per-asset value composition deviates
    /// from the aggregate ideal by more than the configured bound.
    fn check_ratio_guard(&self, input: &DivisionInput<'_>) -> EngineResult<()> {
        let guard = self.config().flush_ratio_guard_bps;
        if guard >= FULL_ALLOCATION {
            return Ok(());
        }
        let ideal = ideal_division(input)?;
        let n = input.basket.len();
        let mut aggregate = Basket::zero(n);
        for sub in &ideal {
            aggregate.add_assign(sub)?;
        }
        let basket_total = input.basket.usd_value(input.prices, input.decimals)?;
        let ideal_total = aggregate.usd_value(input.prices, input.decimals)?;
        if basket_total == 0 || ideal_total == 0 {
            return Ok(());
        }
        for a in 0..n {
            let actual = usd_value(input.basket.amounts[a], input.prices[a], input.decimals[a])?;
            let wanted = usd_value(aggregate.amounts[a], input.prices[a], input.decimals[a])?;
            let actual_bps = mul_div(actual, FULL_ALLOCATION as u128, basket_total)?;
            let wanted_bps = mul_div(wanted, FULL_ALLOCATION as u128, ideal_total)?;
            let deviation = actual_bps.abs_diff(wanted_bps);
            if deviation > guard as u128 {
                return Err(EngineError::SlippageGuard(format!(
                    "asset index {} is {} bps from ideal, bound is {} bps",
                    a, deviation, guard
                )));
            }
        }
        Ok(())
    }
}
