// src/connectors/oracle.rs

use crate::error::{EngineError, EngineResult};
use crate::models::PriceQuote;
use crate::traits::PriceOracle;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A settable in-memory price oracle. Quotes carry the timestamp they were
/// set at, so staleness enforcement in the engine can be exercised by
/// backdating quotes.
pub struct StaticPriceOracle {
    quotes: RwLock<HashMap<String, PriceQuote>>,
}

impl StaticPriceOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            quotes: RwLock::new(HashMap::new()),
        })
    }

    /// Sets a quote stamped with the current time.
    pub async fn set_price(&self, symbol: impl Into<String>, price: u128) {
        self.set_price_at(symbol, price, Utc::now().timestamp()).await;
    }

    /// Sets a quote with an explicit timestamp (for staleness tests).
    pub async fn set_price_at(&self, symbol: impl Into<String>, price: u128, timestamp: i64) {
        self.quotes
            .write()
            .await
            .insert(symbol.into(), PriceQuote { price, timestamp });
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn exchange_rate(&self, symbol: &str) -> EngineResult<PriceQuote> {
        self.quotes
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| EngineError::StaleData {
                asset: symbol.to_string(),
                detail: "no quote available".to_string(),
            })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let oracle = StaticPriceOracle::new();
        oracle.set_price("ETH", 1208_16000000).await;
        let q = oracle.exchange_rate("ETH").await.unwrap();
        assert_eq!(q.price, 1208_16000000);

        assert!(matches!(
            oracle.exchange_rate("DOGE").await,
            Err(EngineError::StaleData { .. })
        ));
    }
}
