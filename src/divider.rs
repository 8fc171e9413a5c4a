// src/divider.rs
//
// Deposit Ratio Divider: splits a multi-asset deposit basket across
// strategies that each demand their own asset ratio, without swaps, tracking
// the target allocation as closely as the basket's actual composition allows.
//
// The scheme is "maximal ideal plus remainder", in three phases:
//   1. Compute the ideal per-strategy division assuming the basket matched
//      the aggregate ideal ratio exactly.
//   2. Scale that ideal division down by the limiting asset (the asset with
//      the smallest actual/ideal quotient), consuming the limiting asset
//      fully. The scaled division can never exceed the basket.
//   3. Split the leftover remainder per asset directly by allocation weight,
//      assigning integer-rounding dust to the first non-zero-allocation
//      strategy so the sub-baskets reconstruct the input exactly.

use crate::error::{EngineError, EngineResult};
use crate::models::{
    mul_div, usd_value, AllocationVector, Basket, FULL_ALLOCATION,
};
use log::debug;
use num_bigint::BigUint;

/// Everything the divider needs, positional throughout: `ratios[s][a]` is
/// strategy `s`'s required weight for asset `a`, `prices[a]` the USD price
/// (8 decimals) per whole token, `decimals[a]` the asset's base-unit scale.
pub struct DivisionInput<'a> {
    pub basket: &'a Basket,
    pub allocation: &'a AllocationVector,
    pub ratios: &'a [Vec<u128>],
    pub prices: &'a [u128],
    pub decimals: &'a [u8],
}

impl DivisionInput<'_> {
    fn validate(&self) -> EngineResult<()> {
        let n_assets = self.basket.len();
        let n_strategies = self.ratios.len();
        if n_assets == 0 {
            return Err(EngineError::Configuration("empty basket".to_string()));
        }
        if self.prices.len() != n_assets || self.decimals.len() != n_assets {
            return Err(EngineError::Configuration(
                "price/decimal vectors do not match asset group".to_string(),
            ));
        }
        self.allocation.validate(n_strategies)?;
        for (s, ratio) in self.ratios.iter().enumerate() {
            if ratio.len() != n_assets {
                return Err(EngineError::Configuration(format!(
                    "ratio of strategy index {} has {} entries, expected {}",
                    s,
                    ratio.len(),
                    n_assets
                )));
            }
            // A strategy we intend to fund must be able to accept something.
            if self.allocation.weights[s] > 0 && ratio.iter().all(|&r| r == 0) {
                return Err(EngineError::Configuration(format!(
                    "strategy index {} has all-zero asset ratio",
                    s
                )));
            }
        }
        for (a, &price) in self.prices.iter().enumerate() {
            if price == 0 {
                return Err(EngineError::Configuration(format!(
                    "zero exchange rate for asset index {}",
                    a
                )));
            }
        }
        Ok(())
    }
}

/// Phase 1 only: the ideal per-strategy division, assuming the deposit basket
/// matches the aggregate ideal ratio exactly. Exposed separately because the
/// worked-example scenario checks this intermediate.
///
/// For strategy `s` and asset `a`:
/// `ideal[s][a] = (V * alloc_s / FULL) * r_sa / sum_a'(usd(r_sa'))`
/// where `V` is the basket's total USD value.
pub fn ideal_division(input: &DivisionInput) -> EngineResult<Vec<Basket>> {
    input.validate()?;
    let n_assets = input.basket.len();
    let total_usd = input.basket.usd_value(input.prices, input.decimals)?;

    let mut out = Vec::with_capacity(input.ratios.len());
    for (s, ratio) in input.ratios.iter().enumerate() {
        let weight = input.allocation.weights[s];
        if weight == 0 || total_usd == 0 {
            out.push(Basket::zero(n_assets));
            continue;
        }
        // USD value of one "ratio unit" basket of this strategy.
        let mut denom: u128 = 0;
        for a in 0..n_assets {
            denom = denom
                .checked_add(usd_value(ratio[a], input.prices[a], input.decimals[a])?)
                .ok_or_else(|| EngineError::Numeric("ratio value overflow".to_string()))?;
        }
        if denom == 0 {
            return Err(EngineError::Configuration(format!(
                "ratio of strategy index {} has zero total value",
                s
            )));
        }
        let strategy_usd = mul_div(total_usd, weight as u128, FULL_ALLOCATION as u128)?;
        let mut amounts = Vec::with_capacity(n_assets);
        for a in 0..n_assets {
            amounts.push(mul_div(strategy_usd, ratio[a], denom)?);
        }
        out.push(Basket::new(amounts));
    }
    Ok(out)
}

/// Full two-phase division. The returned sub-baskets sum component-wise to
/// exactly the input basket, with no negative entries possible.
pub fn divide_deposit(input: &DivisionInput) -> EngineResult<Vec<Basket>> {
    input.validate()?;
    let n_assets = input.basket.len();
    let n_strategies = input.ratios.len();

    // A single-strategy vault routes 100% with zero division overhead.
    if n_strategies == 1 {
        return Ok(vec![input.basket.clone()]);
    }
    if input.basket.is_zero() {
        return Ok(vec![Basket::zero(n_assets); n_strategies]);
    }
    // A single-asset group has a trivial ratio: split by allocation directly.
    if n_assets == 1 {
        return split_by_allocation(input.basket, input.allocation);
    }

    let ideal = ideal_division(input)?;

    // Aggregate ideal per asset.
    let mut aggregate = vec![0u128; n_assets];
    for sub in &ideal {
        for a in 0..n_assets {
            aggregate[a] += sub.amounts[a];
        }
    }

    // Find the limiting asset: the smallest actual/ideal quotient among
    // assets the ideal division wants. Compared as exact fractions.
    let mut limiting: Option<(u128, u128)> = None;
    for a in 0..n_assets {
        if aggregate[a] == 0 {
            continue;
        }
        let candidate = (input.basket.amounts[a], aggregate[a]);
        match limiting {
            None => limiting = Some(candidate),
            Some(current) => {
                if frac_lt(candidate.0, candidate.1, current.0, current.1) {
                    limiting = Some(candidate);
                }
            }
        }
    }

    // Scale the ideal division by the limiting factor. With no limiting
    // asset (zero-value basket composition) everything is remainder.
    let mut result = vec![Basket::zero(n_assets); n_strategies];
    let mut assigned = vec![0u128; n_assets];
    if let Some((num, den)) = limiting {
        if num > 0 {
            for s in 0..n_strategies {
                for a in 0..n_assets {
                    let scaled = mul_div(ideal[s].amounts[a], num, den)?;
                    result[s].amounts[a] = scaled;
                    assigned[a] += scaled;
                }
            }
        }
        debug!(
            "divider: limiting factor {}/{} across {} assets",
            num, den, n_assets
        );
    }

    // Phase 3: the remainder is non-negative by construction of the limiting
    // factor; split it per asset by allocation weight.
    for a in 0..n_assets {
        let remainder = input.basket.amounts[a] - assigned[a];
        if remainder == 0 {
            continue;
        }
        for s in 0..n_strategies {
            let share = mul_div(
                remainder,
                input.allocation.weights[s] as u128,
                FULL_ALLOCATION as u128,
            )?;
            result[s].amounts[a] += share;
        }
    }

    assign_dust(input.basket, input.allocation, &mut result)?;
    Ok(result)
}

/// Splits a basket by allocation weight alone (no ratio machinery), dust to
/// the first funded strategy. Used for single-asset groups, where the ratio
/// carries no information.
pub fn split_by_allocation(
    basket: &Basket,
    allocation: &AllocationVector,
) -> EngineResult<Vec<Basket>> {
    let n_assets = basket.len();
    let mut result = vec![Basket::zero(n_assets); allocation.len()];
    for a in 0..n_assets {
        for (s, sub) in result.iter_mut().enumerate() {
            sub.amounts[a] = mul_div(
                basket.amounts[a],
                allocation.weights[s] as u128,
                FULL_ALLOCATION as u128,
            )?;
        }
    }
    assign_dust(basket, allocation, &mut result)?;
    Ok(result)
}

/// Assigns per-asset rounding dust to the first strategy with a non-zero
/// allocation, guaranteeing exact component-wise conservation.
fn assign_dust(
    basket: &Basket,
    allocation: &AllocationVector,
    result: &mut [Basket],
) -> EngineResult<()> {
    let dust_target = allocation
        .weights
        .iter()
        .position(|&w| w > 0)
        .ok_or_else(|| EngineError::Configuration("allocation is all zero".to_string()))?;
    for a in 0..basket.len() {
        let total: u128 = result.iter().map(|sub| sub.amounts[a]).sum();
        let dust = basket.amounts[a]
            .checked_sub(total)
            .ok_or_else(|| EngineError::Numeric("division exceeded basket".to_string()))?;
        result[dust_target].amounts[a] += dust;
    }
    Ok(())
}

/// Exact fraction comparison a/b < c/d without overflow.
fn frac_lt(a: u128, b: u128, c: u128, d: u128) -> bool {
    BigUint::from(a) * BigUint::from(d) < BigUint::from(c) * BigUint::from(b)
}

// =============================================================================
// Tests
// =============================================================================
