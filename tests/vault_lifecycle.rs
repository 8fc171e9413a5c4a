// tests/vault_lifecycle.rs
//
// End-to-end lifecycle over in-memory strategies: request, flush, harvest,
// synchronize, claim. Two $1 stable assets at six decimals keep every
// expected amount exact.

use std::sync::Arc;
use vault_engine::connectors::oracle::StaticPriceOracle;
use vault_engine::connectors::simulated::SimulatedYieldAdapter;
use vault_engine::engine::{EngineBuilder, EngineConfig, VaultEngine};
use vault_engine::error::EngineError;
use vault_engine::models::{AllocationVector, Asset, Basket, StrategyId, VaultId};

const E6: u128 = 1_000_000;
const E8: u128 = 100_000_000;
/// Vault shares minted per USD-unit on first deposit.
const M: u128 = 1_000_000;

struct Setup {
    engine: VaultEngine,
    oracle: Arc<StaticPriceOracle>,
    adapters: Vec<Arc<SimulatedYieldAdapter>>,
    vault: VaultId,
}

/// One vault over N simulated strategies, all demanding a 1:1 USDC/USDT
/// ratio, with both prices pinned at $1.
async fn two_asset_setup(weights: Vec<u64>) -> Setup {
    two_asset_setup_with(weights, EngineConfig::default()).await
}

async fn two_asset_setup_with(weights: Vec<u64>, config: EngineConfig) -> Setup {
    let oracle = StaticPriceOracle::new();
    oracle.set_price("USDC", E8).await;
    oracle.set_price("USDT", E8).await;

    let mut builder = EngineBuilder::new().with_config(config);
    let group = builder
        .add_asset_group(
            "stables",
            vec![
                Asset {
                    symbol: "USDC".to_string(),
                    decimals: 6,
                },
                Asset {
                    symbol: "USDT".to_string(),
                    decimals: 6,
                },
            ],
        )
        .unwrap();

    let mut adapters = Vec::new();
    let mut ids = Vec::new();
    for i in 0..weights.len() {
        let adapter = SimulatedYieldAdapter::new(format!("sim-{}", i), vec![6, 6], vec![E6, E6]);
        let id = builder
            .add_strategy(format!("sim-{}", i), group, adapter.clone(), 20 + 10 * i as u8)
            .unwrap();
        adapters.push(adapter);
        ids.push(id);
    }
    let vault = builder
        .add_vault("stables-vault", group, ids, AllocationVector::new(weights))
        .unwrap();

    Setup {
        engine: builder.build(oracle.clone()),
        oracle,
        adapters,
        vault,
    }
}

/// Flush, harvest every strategy, synchronize.
async fn settle(engine: &VaultEngine, vault: VaultId) {
    engine.flush(vault).await.unwrap();
    for i in 0..engine.store().strategies.len() {
        engine.harvest(StrategyId(i as u32)).await.unwrap();
    }
    engine.synchronize(vault).await.unwrap();
}

#[tokio::test]
async fn test_deposit_settles_across_three_strategies() {
    let s = two_asset_setup(vec![5000, 3000, 2000]).await;

    // $600 USDC + $400 USDT.
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![600 * E6, 400 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;

    // 1:1 ratios with a 600/400 basket: the 400 USDT side is limiting, the
    // 200 USDC surplus is split by allocation weight.
    assert_eq!(s.adapters[0].holdings().await.amounts, vec![300 * E6, 200 * E6]);
    assert_eq!(s.adapters[1].holdings().await.amounts, vec![180 * E6, 120 * E6]);
    assert_eq!(s.adapters[2].holdings().await.amounts, vec![120 * E6, 80 * E6]);

    let shares = s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();
    assert_eq!(shares, 1000 * E8 * M);
    assert_eq!(s.engine.account_shares(s.vault, "alice").await.unwrap(), shares);
    assert_eq!(s.engine.vault_value(s.vault).await.unwrap(), 1000 * E8);
}

#[tokio::test]
async fn test_withdrawal_round_trip_returns_pro_rata_assets() {
    let s = two_asset_setup(vec![5000, 3000, 2000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![600 * E6, 400 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    let shares = s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();

    // Withdraw half the position.
    let wid = s
        .engine
        .request_withdrawal(s.vault, "alice", shares / 2)
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    let basket = s.engine.claim_withdrawal(s.vault, wid, "alice").await.unwrap();

    assert_eq!(basket.amounts, vec![300 * E6, 200 * E6]);
    assert_eq!(
        s.engine.account_shares(s.vault, "alice").await.unwrap(),
        shares / 2
    );
    assert_eq!(s.engine.vault_value(s.vault).await.unwrap(), 500 * E8);
}

#[tokio::test]
async fn test_redundant_flush_and_harvest_are_noops() {
    let s = two_asset_setup(vec![6000, 4000]).await;
    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;

    let holdings_before = s.adapters[0].holdings().await;

    // Nothing queued: flush keeps the index, harvest keeps the records.
    assert_eq!(s.engine.flush(s.vault).await.unwrap(), 1);
    assert_eq!(s.engine.harvest(StrategyId(0)).await.unwrap(), 1);
    assert_eq!(s.engine.harvest(StrategyId(0)).await.unwrap(), 1);
    assert_eq!(s.adapters[0].holdings().await, holdings_before);
    assert_eq!(s.engine.synchronize(s.vault).await.unwrap(), 1);
}

#[tokio::test]
async fn test_cancel_before_flush_restores_state() {
    let s = two_asset_setup(vec![10_000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![50 * E6, 50 * E6]))
        .await
        .unwrap();
    s.engine.cancel_request(s.vault, id, "alice").await.unwrap();

    // The cycle flushes empty and routes nothing.
    assert_eq!(s.engine.flush(s.vault).await.unwrap(), 1);
    assert_eq!(s.engine.harvest(StrategyId(0)).await.unwrap(), 0);
    assert!(s.adapters[0].holdings().await.is_zero());

    // A flushed (here: cancelled) request can no longer be cancelled twice.
    assert!(matches!(
        s.engine.cancel_request(s.vault, id, "alice").await,
        Err(EngineError::OrderingViolation(_))
    ));
}

#[tokio::test]
async fn test_cycles_settle_strictly_in_order() {
    let s = two_asset_setup(vec![6000, 4000]).await;
    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();

    // Harvests have not run: targeted sync refuses, bulk sync stops quietly.
    assert!(matches!(
        s.engine.synchronize_cycle(s.vault, 0).await,
        Err(EngineError::OrderingViolation(_))
    ));
    assert_eq!(s.engine.synchronize(s.vault).await.unwrap(), 0);

    // A future cycle can never settle ahead of cycle 0.
    assert!(matches!(
        s.engine.synchronize_cycle(s.vault, 3).await,
        Err(EngineError::OrderingViolation(_))
    ));

    s.engine.harvest(StrategyId(0)).await.unwrap();
    s.engine.harvest(StrategyId(1)).await.unwrap();
    assert_eq!(s.engine.synchronize_cycle(s.vault, 0).await.unwrap(), 1);
    // Re-settling a done cycle is a no-op.
    assert_eq!(s.engine.synchronize_cycle(s.vault, 0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_stale_quote_aborts_flush_without_losing_requests() {
    let s = two_asset_setup(vec![10_000]).await;
    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();

    // Backdate one quote past the staleness bound.
    let old = chrono::Utc::now().timestamp() - 7200;
    s.oracle.set_price_at("USDT", E8, old).await;
    assert!(matches!(
        s.engine.flush(s.vault).await,
        Err(EngineError::StaleData { .. })
    ));

    // The cycle survived the abort; a fresh quote lets it through.
    s.oracle.set_price("USDT", E8).await;
    assert_eq!(s.engine.flush(s.vault).await.unwrap(), 1);
    s.engine.harvest(StrategyId(0)).await.unwrap();
    assert_eq!(s.engine.synchronize(s.vault).await.unwrap(), 1);
}

#[tokio::test]
async fn test_yield_accrues_and_mints_fee_shares() {
    let s = two_asset_setup(vec![10_000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![500 * E6, 500 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();

    // +1% on the next harvest.
    s.adapters[0].set_next_yield(10_000_000_000).await;
    s.engine
        .request_deposit(s.vault, "bob", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;

    let entry = s.engine.store().strategy(StrategyId(0)).unwrap();
    let st = entry.state.read().await;
    let rec = st.records.last().unwrap();
    assert_eq!(rec.yield_ppt, 10_000_000_000);
    assert!(rec.fee_shares > 0);
    assert_eq!(st.cumulative_yield_ppt, 10_000_000_000);
    drop(st);

    // $1000 compounded 1% plus bob's $200, less the fee dilution.
    let value = s.engine.vault_value(s.vault).await.unwrap();
    assert!(value > 1205 * E8 && value < 1210 * E8, "value {}", value);
}

#[tokio::test]
async fn test_repeated_failures_decommission_then_emergency_withdraw() {
    let s = two_asset_setup(vec![10_000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![500 * E6, 500 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();

    // A second cycle whose harvest hits a broken adapter three times.
    s.adapters[0].fail_next_harvests(3).await;
    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();

    for _ in 0..3 {
        let err = s.engine.harvest(StrategyId(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::AdapterFailure { strategy: 0, .. }));
    }
    // Third strike decommissioned it; further harvests are refused outright.
    assert!(matches!(
        s.engine.harvest(StrategyId(0)).await,
        Err(EngineError::Configuration(_))
    ));

    // Everything comes back: $1000 invested plus the $200 never invested.
    let returned = s.engine.emergency_withdraw(StrategyId(0)).await.unwrap();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].0, s.vault);
    assert_eq!(returned[0].1.amounts, vec![600 * E6, 600 * E6]);

    let vault = s.engine.store().vault(s.vault).unwrap();
    let vs = vault.state.read().await;
    assert_eq!(vs.emergency_claims.amounts, vec![600 * E6, 600 * E6]);
}

#[tokio::test]
async fn test_flush_routes_around_decommissioned_strategy() {
    let s = two_asset_setup(vec![5000, 5000]).await;
    s.engine.decommission(StrategyId(0)).await.unwrap();

    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![400 * E6, 400 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();

    // The live strategy absorbs the dead one's weight.
    let dead = s.engine.store().strategy(StrategyId(0)).unwrap();
    assert!(dead.state.read().await.pending.is_empty());
    let live = s.engine.store().strategy(StrategyId(1)).unwrap();
    let st = live.state.read().await;
    assert_eq!(st.pending.len(), 1);
    assert_eq!(st.pending[0].deposit.amounts, vec![400 * E6, 400 * E6]);
}

#[tokio::test]
async fn test_reallocate_refuses_unsynchronized_vault() {
    let s = two_asset_setup(vec![5000, 5000]).await;
    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();

    assert!(matches!(
        s.engine
            .reallocate(s.vault, AllocationVector::new(vec![8000, 2000]))
            .await,
        Err(EngineError::OrderingViolation(_))
    ));
}

#[tokio::test]
async fn test_reallocate_moves_capital_and_converges() {
    let s = two_asset_setup(vec![5000, 5000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![500 * E6, 500 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();
    assert_eq!(s.adapters[0].holdings().await.amounts, vec![250 * E6, 250 * E6]);

    let target = AllocationVector::new(vec![8000, 2000]);
    s.engine.reallocate(s.vault, target.clone()).await.unwrap();

    // 30% of the pool moved from strategy 1 to strategy 0.
    assert_eq!(s.adapters[0].holdings().await.amounts, vec![400 * E6, 400 * E6]);
    assert_eq!(s.adapters[1].holdings().await.amounts, vec![100 * E6, 100 * E6]);
    assert_eq!(s.engine.vault_value(s.vault).await.unwrap(), 1000 * E8);

    // Already on target: a second pass moves nothing.
    s.engine.reallocate(s.vault, target.clone()).await.unwrap();
    let vault = s.engine.store().vault(s.vault).unwrap();
    let vs = vault.state.read().await;
    assert_eq!(vs.reallocations.len(), 2);
    assert_eq!(vs.reallocations[1].moved_usd, 0);
    assert_eq!(vs.allocation, target);
}

#[tokio::test]
async fn test_aborted_reallocation_parks_redeemed_assets() {
    let s = two_asset_setup(vec![5000, 5000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![500 * E6, 500 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();

    // The receiving adapter rejects the re-deposit mid-pass, after the
    // over-allocated side has already been redeemed.
    s.adapters[0].fail_next_deposits(1).await;
    let err = s
        .engine
        .reallocate(s.vault, AllocationVector::new(vec![8000, 2000]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AdapterFailure { .. }));

    // The $300 redeemed out of strategy 1 is parked, not lost, and the
    // old allocation stays in force.
    let vault = s.engine.store().vault(s.vault).unwrap();
    let vs = vault.state.read().await;
    assert_eq!(vs.emergency_claims.amounts, vec![150 * E6, 150 * E6]);
    assert_eq!(vs.allocation, AllocationVector::new(vec![5000, 5000]));
    assert!(vs.reallocations.is_empty());
    drop(vs);

    // Invested value plus parked claims still account for every dollar.
    assert_eq!(s.engine.vault_value(s.vault).await.unwrap(), 700 * E8);
}

#[tokio::test]
async fn test_lagging_sync_prices_deposit_at_its_own_harvest() {
    let s = two_asset_setup(vec![10_000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![500 * E6, 500 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();

    // Bob's cycle flushes and harvests but is not yet synchronized.
    let bob = s
        .engine
        .request_deposit(s.vault, "bob", Basket::new(vec![50 * E6, 50 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();
    s.engine.harvest(StrategyId(0)).await.unwrap();

    // +10% lands only after bob's harvest, inside carol's cycle.
    s.adapters[0].set_next_yield(100_000_000_000).await;
    s.engine
        .request_deposit(s.vault, "carol", Basket::new(vec![55 * E6, 55 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();
    s.engine.harvest(StrategyId(0)).await.unwrap();

    // Both cycles settle now. Bob's $100 entered a $1000 vault before any
    // yield, so his mint is exactly a tenth of alice's, and the yield that
    // accrued afterwards cannot dilute him retroactively.
    assert_eq!(s.engine.synchronize(s.vault).await.unwrap(), 3);
    let shares = s.engine.claim_deposit(s.vault, bob, "bob").await.unwrap();
    assert_eq!(shares, 10_000_000_000_000_000);
}

#[tokio::test]
async fn test_failed_harvest_attempt_keeps_measured_yield() {
    let s = two_asset_setup(vec![10_000]).await;
    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![500 * E6, 500 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;
    s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();

    // The adapter settles +10% on the first attempt, then fails the deposit
    // step of the same attempt.
    s.adapters[0].set_next_yield(100_000_000_000).await;
    s.adapters[0].fail_next_deposits(1).await;
    s.engine
        .request_deposit(s.vault, "bob", Basket::new(vec![50 * E6, 50 * E6]))
        .await
        .unwrap();
    s.engine.flush(s.vault).await.unwrap();
    assert!(matches!(
        s.engine.harvest(StrategyId(0)).await,
        Err(EngineError::AdapterFailure { strategy: 0, .. })
    ));

    // The retry measures a flat adapter, yet the committed record carries
    // the yield the first attempt consumed.
    assert_eq!(s.engine.harvest(StrategyId(0)).await.unwrap(), 2);
    let entry = s.engine.store().strategy(StrategyId(0)).unwrap();
    let st = entry.state.read().await;
    let rec = st.records.last().unwrap();
    assert_eq!(rec.yield_ppt, 100_000_000_000);
    assert!(rec.fee_shares > 0);
    assert_eq!(st.cumulative_yield_ppt, 100_000_000_000);
    assert_eq!(st.consecutive_failures, 0);
}

#[tokio::test]
async fn test_ratio_guard_aborts_lopsided_flush() {
    let s = two_asset_setup_with(
        vec![5000, 5000],
        EngineConfig {
            flush_ratio_guard_bps: 1000,
            ..EngineConfig::default()
        },
    )
    .await;

    // All strategies want 1:1, so an all-USDC basket sits 5000 bps from the
    // ideal composition.
    s.engine
        .request_deposit(s.vault, "alice", Basket::new(vec![1000 * E6, 0]))
        .await
        .unwrap();
    assert!(matches!(
        s.engine.flush(s.vault).await,
        Err(EngineError::SlippageGuard(_))
    ));

    // The cycle survived the abort; a balancing deposit lets it through.
    s.engine
        .request_deposit(s.vault, "bob", Basket::new(vec![0, 1000 * E6]))
        .await
        .unwrap();
    assert_eq!(s.engine.flush(s.vault).await.unwrap(), 1);
    for i in 0..2 {
        s.engine.harvest(StrategyId(i)).await.unwrap();
    }
    assert_eq!(s.engine.synchronize(s.vault).await.unwrap(), 1);
    assert_eq!(s.engine.vault_value(s.vault).await.unwrap(), 2000 * E8);
}

#[tokio::test]
async fn test_yield_on_empty_strategy_mints_no_fees() {
    let s = two_asset_setup(vec![10_000]).await;
    // Yield reported before anything is invested has no owner.
    s.adapters[0].set_next_yield(50_000_000_000).await;

    let id = s
        .engine
        .request_deposit(s.vault, "alice", Basket::new(vec![100 * E6, 100 * E6]))
        .await
        .unwrap();
    settle(&s.engine, s.vault).await;

    let entry = s.engine.store().strategy(StrategyId(0)).unwrap();
    let st = entry.state.read().await;
    let rec = st.records.last().unwrap();
    assert_eq!(rec.yield_ppt, 50_000_000_000);
    assert_eq!(rec.fee_shares, 0);
    assert_eq!(rec.shares_minted, 200 * E8 * M);
    drop(st);

    // Alice owns the whole vault, undiluted.
    let shares = s.engine.claim_deposit(s.vault, id, "alice").await.unwrap();
    assert_eq!(shares, 200 * E8 * M);
}
