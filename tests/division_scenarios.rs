// tests/division_scenarios.rs
//
// Deposit division over a realistic three-asset basket: ETH/BTC/BNB at
// observed market prices, split across three strategies at a 60/30/10
// allocation. Checks exact conservation and that each strategy's slice
// tracks its allocation weight in value terms.

use vault_engine::divider::{divide_deposit, ideal_division, DivisionInput};
use vault_engine::models::{AllocationVector, Basket, FULL_ALLOCATION};

const ETH_DEC: u8 = 18;
const BTC_DEC: u8 = 8;
const BNB_DEC: u8 = 18;

// USD prices at 8 decimals.
const ETH_PRICE: u128 = 120_816_000_000; // $1208.16
const BTC_PRICE: u128 = 1_640_471_000_000; // $16404.71
const BNB_PRICE: u128 = 27_039_000_000; // $270.39

/// 279.18 ETH, 20.20 BTC, 1225.09 BNB.
fn market_basket() -> Basket {
    Basket::new(vec![
        27_918 * 10u128.pow(16),
        2_020_000_000,
        122_509 * 10u128.pow(16),
    ])
}

/// Per-strategy required ratios in base units, roughly one ETH to 0.07 BTC
/// to 4.5 BNB, with small per-strategy variation.
fn strategy_ratios() -> Vec<Vec<u128>> {
    vec![
        vec![10u128.pow(18), 7_400_000, 45 * 10u128.pow(17)],
        vec![10u128.pow(18), 7_000_000, 44 * 10u128.pow(17)],
        vec![10u128.pow(18), 7_600_000, 46 * 10u128.pow(17)],
    ]
}

fn prices() -> Vec<u128> {
    vec![ETH_PRICE, BTC_PRICE, BNB_PRICE]
}

fn decimals() -> Vec<u8> {
    vec![ETH_DEC, BTC_DEC, BNB_DEC]
}

fn usd(basket: &Basket) -> u128 {
    basket.usd_value(&prices(), &decimals()).unwrap()
}

#[test]
fn test_three_strategy_split_conserves_every_asset() {
    let basket = market_basket();
    let allocation = AllocationVector::new(vec![6000, 3000, 1000]);
    let ratios = strategy_ratios();
    let input = DivisionInput {
        basket: &basket,
        allocation: &allocation,
        ratios: &ratios,
        prices: &prices(),
        decimals: &decimals(),
    };

    let subs = divide_deposit(&input).unwrap();
    assert_eq!(subs.len(), 3);

    // Exact conservation, asset by asset, down to the base unit.
    for a in 0..3 {
        let routed: u128 = subs.iter().map(|s| s.amounts[a]).sum();
        assert_eq!(routed, basket.amounts[a], "asset index {}", a);
    }
}

#[test]
fn test_three_strategy_split_tracks_allocation_in_value() {
    let basket = market_basket();
    let allocation = AllocationVector::new(vec![6000, 3000, 1000]);
    let ratios = strategy_ratios();
    let input = DivisionInput {
        basket: &basket,
        allocation: &allocation,
        ratios: &ratios,
        prices: &prices(),
        decimals: &decimals(),
    };

    let subs = divide_deposit(&input).unwrap();
    let total = usd(&basket);
    assert!(total > 0);

    // Each slice lands within 1% of its target value share. The slack
    // covers per-asset flooring and the remainder redistribution.
    for (i, sub) in subs.iter().enumerate() {
        let target = total * allocation.weights[i] as u128 / FULL_ALLOCATION as u128;
        let actual = usd(sub);
        let bound = total / 100;
        assert!(
            actual.abs_diff(target) <= bound,
            "strategy {} got {} USD-units, target {}",
            i,
            actual,
            target
        );
    }
}

#[test]
fn test_ideal_division_is_exactly_proportional() {
    let basket = market_basket();
    let allocation = AllocationVector::new(vec![6000, 3000, 1000]);
    let ratios = strategy_ratios();
    let input = DivisionInput {
        basket: &basket,
        allocation: &allocation,
        ratios: &ratios,
        prices: &prices(),
        decimals: &decimals(),
    };

    let ideal = ideal_division(&input).unwrap();
    let total = usd(&basket);

    // The ideal slices ignore availability, so their value shares match the
    // allocation almost exactly (only division flooring remains).
    for (i, sub) in ideal.iter().enumerate() {
        let target = total * allocation.weights[i] as u128 / FULL_ALLOCATION as u128;
        let actual = usd(sub);
        assert!(
            actual.abs_diff(target) <= 10,
            "strategy {} ideal {} USD-units, target {}",
            i,
            actual,
            target
        );
    }
}

#[test]
fn test_single_strategy_takes_whole_basket() {
    let basket = market_basket();
    let allocation = AllocationVector::new(vec![10_000]);
    let ratios = vec![strategy_ratios().remove(0)];
    let input = DivisionInput {
        basket: &basket,
        allocation: &allocation,
        ratios: &ratios,
        prices: &prices(),
        decimals: &decimals(),
    };

    let subs = divide_deposit(&input).unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].amounts, basket.amounts);
}

#[test]
fn test_zero_weight_strategy_receives_nothing() {
    let basket = market_basket();
    let allocation = AllocationVector::new(vec![7000, 0, 3000]);
    let ratios = strategy_ratios();
    let input = DivisionInput {
        basket: &basket,
        allocation: &allocation,
        ratios: &ratios,
        prices: &prices(),
        decimals: &decimals(),
    };

    let subs = divide_deposit(&input).unwrap();
    assert!(subs[1].is_zero());
    for a in 0..3 {
        let routed: u128 = subs.iter().map(|s| s.amounts[a]).sum();
        assert_eq!(routed, basket.amounts[a]);
    }
}

#[test]
fn test_awkward_amounts_still_conserve() {
    // Prime-ish amounts that floor badly at every step.
    let baskets = [
        vec![1_000_000_000_000_000_007u128, 99_999_983, 3 * 10u128.pow(18) + 1],
        vec![7u128, 13, 17],
        vec![10u128.pow(18), 0, 0],
    ];
    let allocation = AllocationVector::new(vec![3334, 3333, 3333]);
    let ratios = strategy_ratios();

    for amounts in &baskets {
        let basket = Basket::new(amounts.clone());
        let input = DivisionInput {
            basket: &basket,
            allocation: &allocation,
            ratios: &ratios,
            prices: &prices(),
            decimals: &decimals(),
        };
        let subs = divide_deposit(&input).unwrap();
        for a in 0..3 {
            let routed: u128 = subs.iter().map(|s| s.amounts[a]).sum();
            assert_eq!(routed, basket.amounts[a], "amounts {:?}", amounts);
        }
    }
}
