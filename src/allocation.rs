// src/allocation.rs
//
// Allocation providers: pluggable policies that turn per-strategy risk
// scores and recent yields into a target allocation vector.

use crate::error::{EngineError, EngineResult};
use crate::models::{AllocationVector, StrategyId, FULL_ALLOCATION};
use crate::traits::AllocationProvider;

/// Normalizes arbitrary non-negative weights into basis points summing to
/// exactly [`FULL_ALLOCATION`], using largest-remainder rounding so no
/// strategy is short-changed by more than one basis point.
pub fn normalize_weights(raw: &[u128]) -> EngineResult<AllocationVector> {
    if raw.is_empty() {
        return Err(EngineError::Configuration("no weights to normalize".to_string()));
    }
    let total: u128 = raw.iter().sum();
    if total == 0 {
        return Err(EngineError::Configuration("all weights are zero".to_string()));
    }

    let mut weights = Vec::with_capacity(raw.len());
    let mut remainders: Vec<(usize, u128)> = Vec::with_capacity(raw.len());
    let full = FULL_ALLOCATION as u128;
    for (i, &w) in raw.iter().enumerate() {
        let scaled = w
            .checked_mul(full)
            .ok_or_else(|| EngineError::Numeric("weight overflow".to_string()))?;
        weights.push((scaled / total) as u64);
        remainders.push((i, scaled % total));
    }

    let assigned: u64 = weights.iter().sum();
    let mut shortfall = FULL_ALLOCATION - assigned;
    // Hand the missing basis points to the largest remainders; ties break by
    // position so the result is deterministic.
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (i, _) in remainders {
        if shortfall == 0 {
            break;
        }
        weights[i] += 1;
        shortfall -= 1;
    }
    Ok(AllocationVector::new(weights))
}

/// Returns a caller-fixed allocation regardless of scores. Used by vaults
/// whose allocation is governed externally.
pub struct FixedAllocationProvider {
    allocation: AllocationVector,
}

impl FixedAllocationProvider {
    pub fn new(allocation: AllocationVector) -> Self {
        Self { allocation }
    }
}

impl AllocationProvider for FixedAllocationProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    fn compute_allocation(
        &self,
        strategies: &[StrategyId],
        _risk_scores: &[u8],
        _yields: &[i128],
        _risk_tolerance: i8,
    ) -> EngineResult<AllocationVector> {
        self.allocation.validate(strategies.len())?;
        Ok(self.allocation.clone())
    }
}

/// Linear blend of yield-chasing and risk-avoidance. Each strategy scores
///
/// `score = yield_norm * (10 + tolerance) + (100 - risk) * (10 - tolerance)`
///
/// where `yield_norm` maps the strategy's recent yield onto 0..=100 against
/// the best performer and negative yields floor at zero. Tolerance 10 ignores
/// risk entirely; tolerance -10 ignores yield.
pub struct LinearAllocationProvider;

impl AllocationProvider for LinearAllocationProvider {
    fn name(&self) -> &str {
        "linear"
    }

    fn compute_allocation(
        &self,
        strategies: &[StrategyId],
        risk_scores: &[u8],
        yields: &[i128],
        risk_tolerance: i8,
    ) -> EngineResult<AllocationVector> {
        let n = strategies.len();
        if n == 0 {
            return Err(EngineError::Configuration("no strategies to allocate".to_string()));
        }
        if risk_scores.len() != n || yields.len() != n {
            return Err(EngineError::Configuration(
                "risk/yield vectors do not match strategy list".to_string(),
            ));
        }
        if !(-10..=10).contains(&risk_tolerance) {
            return Err(EngineError::Configuration(format!(
                "risk tolerance {} outside -10..=10",
                risk_tolerance
            )));
        }
        for (i, &risk) in risk_scores.iter().enumerate() {
            if risk > 100 {
                return Err(EngineError::Configuration(format!(
                    "risk score {} of {} outside 0..=100",
                    risk, strategies[i]
                )));
            }
        }

        let best_yield = yields.iter().copied().max().unwrap_or(0).max(0);
        let yield_weight = (10 + risk_tolerance as i32) as u128;
        let safety_weight = (10 - risk_tolerance as i32) as u128;

        let mut scores = Vec::with_capacity(n);
        for i in 0..n {
            let yield_norm: u128 = if best_yield == 0 {
                0
            } else {
                (yields[i].max(0) as u128 * 100) / best_yield as u128
            };
            let safety = (100 - risk_scores[i]) as u128;
            scores.push(yield_norm * yield_weight + safety * safety_weight);
        }

        if scores.iter().all(|&s| s == 0) {
            // Degenerate inputs (all max-risk, no yield): spread uniformly.
            return normalize_weights(&vec![1u128; n]);
        }
        normalize_weights(&scores)
    }
}

// =============================================================================
// Tests
// =============================================================================
