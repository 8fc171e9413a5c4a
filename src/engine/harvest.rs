// src/engine/harvest.rs
//
// Harvest (DHW) Engine: advances one strategy's monotonic harvest index.
// All flushed deposits routed since the last harvest are invested, earmarked
// withdrawal shares are redeemed into assets, yield since the previous
// harvest is measured and fees on positive yield are minted as strategy
// shares. The whole step computes into locals first and commits in one
// block, so a failed attempt leaves no partial state and a retry is safe.

use super::{StrategyEntry, StrategyState, VaultEngine};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    mul_div, Basket, HarvestRecord, StrategyId, StrategyStatus, VaultId,
    FULL_ALLOCATION, INITIAL_SHARE_MULTIPLIER, YIELD_PRECISION,
};
use log::{info, warn};

/// Result of the adapter-facing phase of a harvest, before commit.
struct HarvestOutcome {
    yield_ppt: i128,
    fee_shares: u128,
    shares_minted: u128,
    shares_burned: u128,
    withdrawn: Basket,
    deposit_usd: u128,
    issued_underlying: u128,
    redeemed_underlying: u128,
    value_after: u128,
    total_shares_after: u128,
}

impl VaultEngine {
    /// Processes one pending harvest index for a strategy. A call with no
    /// pending flushed work is a no-op returning the current index, which
    /// makes redundant calls harmless.
    pub async fn harvest(&self, strategy_id: StrategyId) -> EngineResult<u64> {
        let entry = self.store().strategy(strategy_id)?;
        let group = self.store().group(entry.group)?;

        let mut st = entry.state.write().await;
        if st.status == StrategyStatus::Decommissioned {
            return Err(EngineError::Configuration(format!(
                "{} is decommissioned",
                strategy_id
            )));
        }
        if st.pending.is_empty() {
            return Ok(st.next_harvest_index());
        }

        let prices = self.fetch_prices(group).await?;
        let decimals = group.decimals();

        // Aggregate the pending cycle contributions (FIFO; every pending
        // entry settles at this index).
        let mut total_deposit = Basket::zero(group.asset_count());
        let mut total_burn: u128 = 0;
        for p in &st.pending {
            total_deposit.add_assign(&p.deposit)?;
            total_burn += p.withdraw_shares;
        }
        let deposit_usd = total_deposit.usd_value(&prices, &decimals)?;
        let total_shares = st.total_shares;
        let underlying_shares = st.underlying_shares;
        let fee_bps = self.config().ecosystem_fee_bps + self.config().treasury_fee_bps;

        // Settle the external yield first and bank it. The adapter consumes
        // its accrual on this call, so if a later step of the attempt fails
        // the measurement must survive until a retry commits the index.
        let measured = match entry.adapter.harvest().await {
            Ok(y) => y,
            Err(e) => return Err(self.note_harvest_failure(&mut st, strategy_id, e)),
        };
        let yield_ppt = compound_ppt(st.carried_yield_ppt, measured)?;
        st.carried_yield_ppt = yield_ppt;

        let step = run_adapter_phase(
            entry,
            &prices,
            &decimals,
            total_shares,
            underlying_shares,
            &total_deposit,
            deposit_usd,
            total_burn,
            fee_bps,
            yield_ppt,
        )
        .await;

        let outcome = match step {
            Ok(o) => o,
            Err(e) => return Err(self.note_harvest_failure(&mut st, strategy_id, e)),
        };

        // Commit.
        let index = st.next_harvest_index();
        st.total_shares = outcome.total_shares_after;
        st.fee_shares += outcome.fee_shares;
        st.underlying_shares =
            underlying_shares + outcome.issued_underlying - outcome.redeemed_underlying;
        st.cumulative_yield_ppt += outcome.yield_ppt;
        st.carried_yield_ppt = 0;
        st.consecutive_failures = 0;
        st.records.push(HarvestRecord {
            index,
            prices,
            yield_ppt: outcome.yield_ppt,
            fee_shares: outcome.fee_shares,
            total_deposit_usd: outcome.deposit_usd,
            shares_minted: outcome.shares_minted,
            shares_burned: outcome.shares_burned,
            withdrawn: outcome.withdrawn,
            value_after_usd: outcome.value_after,
            total_shares_after: outcome.total_shares_after,
        });
        st.pending.clear();
        info!(
            "{}: harvest index {} committed (yield {} ppt, {} minted, {} burned)",
            strategy_id, index, outcome.yield_ppt, outcome.shares_minted, outcome.shares_burned
        );
        Ok(st.next_harvest_index())
    }

    /// Books one failed harvest attempt: counts it toward decommissioning
    /// and rewrites adapter failures with the engine-level strategy id.
    fn note_harvest_failure(
        &self,
        st: &mut StrategyState,
        strategy_id: StrategyId,
        e: EngineError,
    ) -> EngineError {
        st.consecutive_failures += 1;
        warn!(
            "{}: harvest attempt failed ({}/{}): {}",
            strategy_id,
            st.consecutive_failures,
            self.config().max_adapter_failures,
            e
        );
        if st.consecutive_failures >= self.config().max_adapter_failures {
            st.status = StrategyStatus::Decommissioned;
            warn!("{}: decommissioned after repeated adapter failures", strategy_id);
        }
        match e {
            EngineError::AdapterFailure { reason, .. } => EngineError::AdapterFailure {
                strategy: strategy_id.0,
                reason,
            },
            other => other,
        }
    }

    /// Flags a strategy as decommissioned: flushes route around it and its
    /// capital exits via [`VaultEngine::emergency_withdraw`]. Idempotent.
    pub async fn decommission(&self, strategy_id: StrategyId) -> EngineResult<()> {
        let entry = self.store().strategy(strategy_id)?;
        let mut st = entry.state.write().await;
        if st.status != StrategyStatus::Decommissioned {
            st.status = StrategyStatus::Decommissioned;
            warn!("{}: decommissioned by operator", strategy_id);
        }
        Ok(())
    }

    /// Winds down a decommissioned strategy: redeems everything it still
    /// holds and returns the assets as-is, pro-rata by strategy share, to
    /// the vaults that owned them. Bypasses the ratio divider entirely and
    /// guarantees no yield. Uninvested pending deposits go back verbatim to
    /// the vault that flushed them.
    pub async fn emergency_withdraw(
        &self,
        strategy_id: StrategyId,
    ) -> EngineResult<Vec<(VaultId, Basket)>> {
        let entry = self.store().strategy(strategy_id)?;
        let group = self.store().group(entry.group)?;

        // Phase 1: drain the strategy under its own lock, then release it
        // before touching any vault to keep lock order one-directional.
        let (pool, total_shares, pending) = {
            let mut st = entry.state.write().await;
            if st.status != StrategyStatus::Decommissioned {
                return Err(EngineError::Configuration(format!(
                    "{} is live; decommission it before emergency withdrawal",
                    strategy_id
                )));
            }
            let pool = if st.underlying_shares > 0 {
                entry.adapter.redeem(st.underlying_shares).await?
            } else {
                Basket::zero(group.asset_count())
            };
            let total = st.total_shares;
            let pending = std::mem::take(&mut st.pending);
            st.underlying_shares = 0;
            st.total_shares = 0;
            st.fee_shares = 0;
            (pool, total, pending)
        };

        // Per-vault entitlement: shares still held plus shares earmarked by
        // pending (never-harvested) withdrawals.
        let mut out = Vec::new();
        for vault in &self.store().vaults {
            let mut vs = vault.state.write().await;
            let mut owned = *vs.strategy_shares.get(&strategy_id).unwrap_or(&0);
            let mut returned = Basket::zero(group.asset_count());
            for p in pending.iter().filter(|p| p.vault == vault.id) {
                owned += p.withdraw_shares;
                returned.add_assign(&p.deposit)?;
            }
            if owned > 0 && total_shares > 0 {
                for a in 0..pool.len() {
                    returned.amounts[a] += mul_div(pool.amounts[a], owned, total_shares)?;
                }
            }
            if let Some(s) = vs.strategy_shares.get_mut(&strategy_id) {
                *s = 0;
            }
            if !returned.is_zero() {
                vs.emergency_claims.add_assign(&returned)?;
                out.push((vault.id, returned));
            }
        }
        warn!(
            "{}: emergency withdrawal returned assets to {} vaults",
            strategy_id,
            out.len()
        );
        Ok(out)
    }
}

/// The adapter-facing phase after yield settlement: take fees, redeem
/// exits, invest entries. Pure with respect to engine state; any error here
/// aborts the harvest before anything commits.
#[allow(clippy::too_many_arguments)]
async fn run_adapter_phase(
    entry: &StrategyEntry,
    prices: &[u128],
    decimals: &[u8],
    total_shares: u128,
    underlying_shares: u128,
    total_deposit: &Basket,
    deposit_usd: u128,
    total_burn: u128,
    fee_bps: u64,
    yield_ppt: i128,
) -> EngineResult<HarvestOutcome> {
    let value_now = entry.adapter.current_valuation(prices).await?;

    // Fees only on positive yield, and only when someone owns the yield: a
    // strategy with zero shares has an undefined yield base and mints no
    // fee shares.
    let mut fee_shares = 0u128;
    let mut shares = total_shares;
    if yield_ppt > 0 && total_shares > 0 && value_now > 0 && fee_bps > 0 {
        let yield_usd = mul_div(
            value_now,
            yield_ppt as u128,
            (YIELD_PRECISION + yield_ppt) as u128,
        )?;
        let fee_usd = mul_div(yield_usd, fee_bps as u128, FULL_ALLOCATION as u128)?;
        if fee_usd > 0 && fee_usd < value_now {
            fee_shares = mul_div(shares, fee_usd, value_now - fee_usd)?;
            shares += fee_shares;
        }
    }

    // Redeem earmarked withdrawals at the post-yield share price.
    let mut withdrawn = Basket::zero(total_deposit.len());
    let mut redeemed_underlying = 0u128;
    if total_burn > 0 {
        if total_burn > shares {
            return Err(EngineError::Numeric(format!(
                "burning {} of {} strategy shares",
                total_burn, shares
            )));
        }
        redeemed_underlying = mul_div(underlying_shares, total_burn, shares)?;
        withdrawn = entry.adapter.redeem(redeemed_underlying).await?;
        shares -= total_burn;
    }
    let withdrawn_usd = withdrawn.usd_value(prices, decimals)?;
    let value_mid = value_now.saturating_sub(withdrawn_usd);

    // Invest the cycle's deposits and mint shares against the pre-deposit
    // valuation.
    let mut issued_underlying = 0u128;
    let mut shares_minted = 0u128;
    if !total_deposit.is_zero() {
        issued_underlying = entry.adapter.deposit(total_deposit).await?;
        shares_minted = if shares == 0 || value_mid == 0 {
            deposit_usd
                .checked_mul(INITIAL_SHARE_MULTIPLIER)
                .ok_or_else(|| EngineError::Numeric("initial mint overflow".to_string()))?
        } else {
            mul_div(shares, deposit_usd, value_mid)?
        };
        shares += shares_minted;
    }

    let value_after = entry.adapter.current_valuation(prices).await?;

    Ok(HarvestOutcome {
        yield_ppt,
        fee_shares,
        shares_minted,
        shares_burned: total_burn,
        withdrawn,
        deposit_usd,
        issued_underlying,
        redeemed_underlying,
        value_after,
        total_shares_after: shares,
    })
}

/// Combines two sequential yield percentages (parts per 10^12)
/// multiplicatively: (1 + a)(1 + b) - 1.
fn compound_ppt(a: i128, b: i128) -> EngineResult<i128> {
    if a == 0 {
        return Ok(b);
    }
    if b == 0 {
        return Ok(a);
    }
    let cross = a
        .checked_mul(b)
        .ok_or_else(|| EngineError::Numeric("yield compounding overflow".to_string()))?
        / YIELD_PRECISION;
    a.checked_add(b)
        .and_then(|s| s.checked_add(cross))
        .ok_or_else(|| EngineError::Numeric("yield compounding overflow".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_ppt() {
        let pct = YIELD_PRECISION / 100;
        assert_eq!(compound_ppt(0, 5 * pct).unwrap(), 5 * pct);
        assert_eq!(compound_ppt(5 * pct, 0).unwrap(), 5 * pct);
        // +10% then +10% is +21%.
        assert_eq!(compound_ppt(10 * pct, 10 * pct).unwrap(), 21 * pct);
        // A loss partially cancels a gain.
        assert!(compound_ppt(10 * pct, -10 * pct).unwrap() < 0);
    }
}
