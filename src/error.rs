// src/error.rs
//
// Error taxonomy for the engine. Every batch operation (flush, harvest, sync,
// reallocate) either commits its full state transition or returns one of these
// without mutating anything.

use thiserror::Error;

/// Errors produced by the vault engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Misconfiguration detected before any state mutation: zero ratios,
    /// mismatched asset groups, unknown strategies, invalid allocations.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An oracle quote is missing or older than the configured staleness
    /// bound. The operation is aborted and may be retried later.
    #[error("stale price data for {asset}: {detail}")]
    StaleData { asset: String, detail: String },

    /// The computed basket or valuation fell outside the configured bounds.
    /// The whole operation is aborted atomically.
    #[error("slippage guard tripped: {0}")]
    SlippageGuard(String),

    /// An external yield-source call failed. The harvest step is retryable;
    /// after repeated failures the strategy is decommissioned.
    #[error("adapter failure on strategy {strategy}: {reason}")]
    AdapterFailure { strategy: u32, reason: String },

    /// A caller attempted to process cycles or harvest indices out of order.
    /// Never silently reordered.
    #[error("ordering violation: {0}")]
    OrderingViolation(String),

    /// Referenced vault, strategy, asset group or request does not exist.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// A request is not in a claimable (or cancellable) state for the caller.
    #[error("not claimable: {0}")]
    NotClaimable(String),

    /// Integer arithmetic left the representable range.
    #[error("numeric error: {0}")]
    Numeric(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
