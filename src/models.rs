// src/models.rs

use crate::error::{EngineError, EngineResult};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Precision Constants
// =============================================================================

/// Allocation fractions are expressed in basis points.
pub const FULL_ALLOCATION: u64 = 10_000;

/// USD values carry 8 decimals (one unit = 10^-8 USD).
pub const USD_DECIMALS: u32 = 8;

/// Scale factor for USD prices: price is USD-per-whole-token times this.
pub const PRICE_PRECISION: u128 = 100_000_000;

/// Yield percentages are signed parts per 10^12.
pub const YIELD_PRECISION: i128 = 1_000_000_000_000;

/// Shares minted per USD-precision unit on the first-ever mint of a strategy
/// or vault, so early share prices have headroom for sub-unit yield.
pub const INITIAL_SHARE_MULTIPLIER: u128 = 1_000_000;

// =============================================================================
// Identifiers
// =============================================================================

/// Arena-style identifier for a strategy. Strategies are shared across vaults,
/// so cross-references always go through ids rather than direct references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId(pub u32);

/// Arena-style identifier for a vault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultId(pub u32);

/// Identifier for an asset group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetGroupId(pub u32);

/// Identifier for a queued deposit or withdrawal request.
pub type RequestId = u64;

/// Opaque owner identifier for requests and vault shares. Authorization is
/// out of scope; the engine only matches owners on claim/cancel.
pub type AccountId = String;

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strategy#{}", self.0)
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vault#{}", self.0)
    }
}

// =============================================================================
// Assets and Baskets
// =============================================================================

/// A single fungible asset accepted by an asset group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Ticker-style symbol, used as the oracle lookup key.
    pub symbol: String,
    /// Number of decimals in the asset's base unit.
    pub decimals: u8,
}

/// An ordered, fixed set of distinct assets. Immutable once a vault is
/// created against it; baskets are positional against this ordering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetGroup {
    pub id: AssetGroupId,
    pub name: String,
    pub assets: Vec<Asset>,
}

impl AssetGroup {
    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Per-asset decimals, positional.
    pub fn decimals(&self) -> Vec<u8> {
        self.assets.iter().map(|a| a.decimals).collect()
    }
}

/// A positional basket of per-asset amounts in base units, aligned with an
/// [`AssetGroup`]'s asset ordering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basket {
    pub amounts: Vec<u128>,
}

impl Basket {
    /// An all-zero basket for a group of `n` assets.
    pub fn zero(n: usize) -> Self {
        Self { amounts: vec![0; n] }
    }

    pub fn new(amounts: Vec<u128>) -> Self {
        Self { amounts }
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.amounts.iter().all(|&a| a == 0)
    }

    /// Component-wise addition. Lengths must already match.
    pub fn add_assign(&mut self, other: &Basket) -> EngineResult<()> {
        if self.len() != other.len() {
            return Err(EngineError::Configuration(format!(
                "basket length mismatch: {} vs {}",
                self.len(),
                other.len()
            )));
        }
        for (a, b) in self.amounts.iter_mut().zip(&other.amounts) {
            *a = a
                .checked_add(*b)
                .ok_or_else(|| EngineError::Numeric("basket addition overflow".to_string()))?;
        }
        Ok(())
    }

    /// Component-wise subtraction; errors if any component would go negative.
    pub fn checked_sub(&self, other: &Basket) -> EngineResult<Basket> {
        if self.len() != other.len() {
            return Err(EngineError::Configuration(format!(
                "basket length mismatch: {} vs {}",
                self.len(),
                other.len()
            )));
        }
        let amounts = self
            .amounts
            .iter()
            .zip(&other.amounts)
            .map(|(a, b)| {
                a.checked_sub(*b)
                    .ok_or_else(|| EngineError::Numeric("basket subtraction underflow".to_string()))
            })
            .collect::<EngineResult<Vec<u128>>>()?;
        Ok(Basket { amounts })
    }

    /// Total common-unit (USD, 8 decimals) value of the basket at the given
    /// per-asset prices.
    pub fn usd_value(&self, prices: &[u128], decimals: &[u8]) -> EngineResult<u128> {
        if self.len() != prices.len() || self.len() != decimals.len() {
            return Err(EngineError::Configuration(
                "price vector does not match basket".to_string(),
            ));
        }
        let mut total: u128 = 0;
        for ((&amount, &price), &dec) in self.amounts.iter().zip(prices).zip(decimals) {
            let value = usd_value(amount, price, dec)?;
            total = total
                .checked_add(value)
                .ok_or_else(|| EngineError::Numeric("basket value overflow".to_string()))?;
        }
        Ok(total)
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// Target fraction of vault capital per strategy, in basis points.
/// Positional against the vault's strategy list; must sum to
/// [`FULL_ALLOCATION`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationVector {
    pub weights: Vec<u64>,
}

impl AllocationVector {
    pub fn new(weights: Vec<u64>) -> Self {
        Self { weights }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Validates length against the expected strategy count and that the
    /// weights sum to exactly 100%.
    pub fn validate(&self, expected_len: usize) -> EngineResult<()> {
        if self.weights.len() != expected_len {
            return Err(EngineError::Configuration(format!(
                "allocation has {} entries, expected {}",
                self.weights.len(),
                expected_len
            )));
        }
        let sum: u64 = self.weights.iter().sum();
        if sum != FULL_ALLOCATION {
            return Err(EngineError::Configuration(format!(
                "allocation sums to {} bps, expected {}",
                sum, FULL_ALLOCATION
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Prices
// =============================================================================

/// A single oracle quote: USD price per whole token scaled by
/// [`PRICE_PRECISION`], plus the unix time the quote was produced.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: u128,
    pub timestamp: i64,
}

// =============================================================================
// Requests and Flush Cycles
// =============================================================================

/// Lifecycle of a deposit/withdrawal request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Attached to the open cycle; may still be cancelled by its owner.
    Queued,
    /// The cycle flushed; the request is committed and must run to completion.
    Flushed,
    /// Synchronization completed; the result can be claimed exactly once.
    Claimable,
    Claimed,
    Cancelled,
}

/// A depositor's basket queued against the vault's current open cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositRequest {
    pub id: RequestId,
    pub owner: AccountId,
    pub vault: VaultId,
    pub basket: Basket,
    /// Flush index of the cycle this request rode in.
    pub flush_index: u64,
    pub status: RequestStatus,
    /// Vault shares minted for this deposit, set at synchronization.
    pub claimable_shares: Option<u128>,
}

/// A withdrawer's vault-share amount queued against the open cycle. The
/// shares are escrowed out of the owner's balance at request time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: RequestId,
    pub owner: AccountId,
    pub vault: VaultId,
    pub shares: u128,
    pub flush_index: u64,
    pub status: RequestStatus,
    /// Asset amounts this withdrawal resolved to, set at synchronization.
    pub claimable_basket: Option<Basket>,
}

/// Per-strategy routing produced when a cycle flushes: the sub-basket to
/// invest, the strategy shares to burn, and the harvest index the strategy
/// will reach once it processes this cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyRoute {
    pub strategy: StrategyId,
    pub basket: Basket,
    pub withdraw_shares: u128,
    pub harvest_index: u64,
}

/// State of a flush cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Open,
    Flushed,
    Synced,
}

/// One deposit/withdrawal accumulation cycle of a vault, keyed by
/// (vault, flush index). Immutable once flushed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushCycle {
    pub index: u64,
    pub state: CycleState,
    /// Accumulated per-asset deposit totals.
    pub deposits: Basket,
    /// Accumulated vault-share withdrawal total.
    pub withdrawal_shares: u128,
    pub deposit_request_ids: Vec<RequestId>,
    pub withdrawal_request_ids: Vec<RequestId>,
    /// Prices snapshotted at flush time, used for request-level weighting.
    pub flush_prices: Vec<u128>,
    /// Routing computed at flush time, empty while the cycle is open.
    pub routes: Vec<StrategyRoute>,
}

impl FlushCycle {
    pub fn open(index: u64, asset_count: usize) -> Self {
        Self {
            index,
            state: CycleState::Open,
            deposits: Basket::zero(asset_count),
            withdrawal_shares: 0,
            deposit_request_ids: Vec::new(),
            withdrawal_request_ids: Vec::new(),
            flush_prices: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn has_requests(&self) -> bool {
        !self.deposit_request_ids.is_empty() || !self.withdrawal_request_ids.is_empty()
    }
}

// =============================================================================
// Harvest Records
// =============================================================================

/// Liveness state of a strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Live,
    /// Adapter permanently broken: new deposits rejected, capital wound down
    /// through the emergency-withdraw path.
    Decommissioned,
}

/// Immutable snapshot committed when a strategy completes one harvest index.
/// Synchronization reads these to settle vault cycles against actual results.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub index: u64,
    /// Oracle prices used for this harvest, positional per asset.
    pub prices: Vec<u128>,
    /// Measured yield since the previous harvest, parts per 10^12.
    pub yield_ppt: i128,
    /// Fee shares minted on positive yield.
    pub fee_shares: u128,
    /// USD value of all deposits invested at this index.
    pub total_deposit_usd: u128,
    /// Strategy shares minted for those deposits.
    pub shares_minted: u128,
    /// Strategy shares burned for withdrawals at this index.
    pub shares_burned: u128,
    /// Assets redeemed for the burned shares.
    pub withdrawn: Basket,
    /// Strategy valuation after this harvest committed.
    pub value_after_usd: u128,
    /// Share supply after this harvest committed.
    pub total_shares_after: u128,
}

impl HarvestRecord {
    /// Converts an amount of strategy shares to USD at this record's share
    /// price. Zero supply values to zero.
    pub fn shares_to_usd(&self, shares: u128) -> EngineResult<u128> {
        if self.total_shares_after == 0 {
            return Ok(0);
        }
        mul_div(shares, self.value_after_usd, self.total_shares_after)
    }
}

/// Record of one reallocation pass over a vault.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReallocationRecord {
    pub timestamp: i64,
    /// Harvest index each touched strategy was at when capital moved.
    pub harvest_indices: Vec<(StrategyId, u64)>,
    /// USD value redeemed out of over-allocated strategies.
    pub moved_usd: u128,
    pub new_allocation: AllocationVector,
}

// =============================================================================
// Fixed-point helpers
// =============================================================================

/// Computes `a * b / denom` with a 256-bit intermediate, so 18-decimal token
/// amounts multiplied by USD values cannot overflow mid-computation.
pub fn mul_div(a: u128, b: u128, denom: u128) -> EngineResult<u128> {
    if denom == 0 {
        return Err(EngineError::Numeric("mul_div division by zero".to_string()));
    }
    let wide = BigUint::from(a) * BigUint::from(b) / BigUint::from(denom);
    u128::try_from(wide).map_err(|_| EngineError::Numeric("mul_div overflow".to_string()))
}

/// 10^decimals as u128.
pub fn pow10(decimals: u8) -> u128 {
    10u128.pow(decimals as u32)
}

/// USD (8 decimals) value of `amount` base units priced at `price`
/// (USD-per-whole-token scaled by [`PRICE_PRECISION`]).
pub fn usd_value(amount: u128, price: u128, decimals: u8) -> EngineResult<u128> {
    mul_div(amount, price, pow10(decimals))
}

/// Inverse of [`usd_value`]: base units worth `usd` at `price`.
pub fn amount_from_usd(usd: u128, price: u128, decimals: u8) -> EngineResult<u128> {
    if price == 0 {
        return Err(EngineError::Numeric("zero price".to_string()));
    }
    mul_div(usd, pow10(decimals), price)
}

// =============================================================================
// Tests
// =============================================================================
