// src/connectors/simulated.rs

use crate::error::{EngineError, EngineResult};
use crate::models::{mul_div, Basket, YIELD_PRECISION};
use crate::traits::StrategyAdapter;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Internal state of the simulated yield source.
#[derive(Debug)]
struct SimState {
    /// Required per-asset deposit ratio (settable, so ratio-drift can be
    /// simulated between flush and harvest).
    ratio: Vec<u128>,
    /// Assets currently held by the "external protocol".
    holdings: Basket,
    /// Receipt shares the protocol has issued against those holdings.
    source_shares: u128,
    /// Yield applied on the next harvest, parts per 10^12.
    next_yield_ppt: i128,
    /// Number of upcoming harvest calls that should fail.
    fail_harvests: u32,
    /// Number of upcoming deposit calls that should fail.
    fail_deposits: u32,
}

/// An in-memory yield source: deposits are pooled, harvests compound the
/// pool by a settable percentage, redemptions are pro-rata by receipt share.
///
/// Receipt shares are minted one per base unit deposited; their meaning is
/// internal to this adapter, the engine only does pro-rata arithmetic on
/// them.
pub struct SimulatedYieldAdapter {
    name: String,
    decimals: Vec<u8>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedYieldAdapter {
    /// Creates a new simulated adapter for a group with the given per-asset
    /// decimals and required ratio.
    pub fn new(name: impl Into<String>, decimals: Vec<u8>, ratio: Vec<u128>) -> Arc<Self> {
        let n = decimals.len();
        Arc::new(Self {
            name: name.into(),
            decimals,
            state: Arc::new(Mutex::new(SimState {
                ratio,
                holdings: Basket::zero(n),
                source_shares: 0,
                next_yield_ppt: 0,
                fail_harvests: 0,
                fail_deposits: 0,
            })),
        })
    }

    /// Changes the required deposit ratio.
    pub async fn set_ratio(&self, ratio: Vec<u128>) {
        self.state.lock().await.ratio = ratio;
    }

    /// Sets the yield percentage the next harvest will realize.
    pub async fn set_next_yield(&self, yield_ppt: i128) {
        self.state.lock().await.next_yield_ppt = yield_ppt;
    }

    /// Makes the next `n` harvest calls fail, to exercise retry and
    /// decommissioning paths.
    pub async fn fail_next_harvests(&self, n: u32) {
        self.state.lock().await.fail_harvests = n;
    }

    /// Makes the next `n` deposit calls fail without taking any assets.
    pub async fn fail_next_deposits(&self, n: u32) {
        self.state.lock().await.fail_deposits = n;
    }

    /// Current holdings, for assertions in tests.
    pub async fn holdings(&self) -> Basket {
        self.state.lock().await.holdings.clone()
    }
}

#[async_trait]
impl StrategyAdapter for SimulatedYieldAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn asset_ratio(&self) -> EngineResult<Vec<u128>> {
        Ok(self.state.lock().await.ratio.clone())
    }

    async fn deposit(&self, basket: &Basket) -> EngineResult<u128> {
        let mut state = self.state.lock().await;
        if state.fail_deposits > 0 {
            state.fail_deposits -= 1;
            return Err(EngineError::AdapterFailure {
                strategy: 0,
                reason: format!("adapter {}: simulated deposit outage", self.name),
            });
        }
        if basket.len() != state.holdings.len() {
            return Err(EngineError::Configuration(format!(
                "adapter {}: basket has {} assets, expected {}",
                self.name,
                basket.len(),
                state.holdings.len()
            )));
        }
        state.holdings.add_assign(basket)?;
        let issued: u128 = basket.amounts.iter().sum();
        state.source_shares += issued;
        debug!("adapter {}: deposited, issued {} receipt shares", self.name, issued);
        Ok(issued)
    }

    async fn redeem(&self, shares: u128) -> EngineResult<Basket> {
        let mut state = self.state.lock().await;
        if shares == 0 {
            return Ok(Basket::zero(state.holdings.len()));
        }
        if shares > state.source_shares {
            return Err(EngineError::Configuration(format!(
                "adapter {}: redeeming {} of {} receipt shares",
                self.name, shares, state.source_shares
            )));
        }
        let mut amounts = Vec::with_capacity(state.holdings.len());
        for &held in &state.holdings.amounts {
            amounts.push(mul_div(held, shares, state.source_shares)?);
        }
        let out = Basket::new(amounts);
        state.holdings = state.holdings.checked_sub(&out)?;
        state.source_shares -= shares;
        Ok(out)
    }

    async fn current_valuation(&self, prices: &[u128]) -> EngineResult<u128> {
        let state = self.state.lock().await;
        state.holdings.usd_value(prices, &self.decimals)
    }

    async fn harvest(&self) -> EngineResult<i128> {
        let mut state = self.state.lock().await;
        if state.fail_harvests > 0 {
            state.fail_harvests -= 1;
            return Err(EngineError::AdapterFailure {
                strategy: 0,
                reason: format!("adapter {}: simulated outage", self.name),
            });
        }
        let y = state.next_yield_ppt;
        if y <= -YIELD_PRECISION {
            return Err(EngineError::Configuration(format!(
                "adapter {}: yield {} would wipe holdings below zero",
                self.name, y
            )));
        }
        if y != 0 {
            // Compound every held asset by the settled percentage.
            let factor = (YIELD_PRECISION + y) as u128;
            for held in state.holdings.amounts.iter_mut() {
                *held = mul_div(*held, factor, YIELD_PRECISION as u128)?;
            }
            state.next_yield_ppt = 0;
        }
        Ok(y)
    }
}

// =============================================================================
// Tests
// =============================================================================
