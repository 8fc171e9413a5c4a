// src/config.rs
//
// Configuration file parsing for the vault engine. Supports TOML config
// files that declare asset groups with seed prices, strategies with their
// simulated yield sources, and vaults with their target allocations.

use crate::connectors::oracle::StaticPriceOracle;
use crate::connectors::simulated::SimulatedYieldAdapter;
use crate::engine::{EngineBuilder, EngineConfig, VaultEngine};
use crate::error::{EngineError, EngineResult};
use crate::models::{pow10, AllocationVector, Asset, AssetGroupId, StrategyId, PRICE_PRECISION};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Configuration Types
// =============================================================================

/// Root configuration structure.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,
    /// Asset groups strategies and vaults operate over
    #[serde(default)]
    pub asset_groups: Vec<AssetGroupConfig>,
    /// List of strategy configurations
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    /// List of vault configurations
    #[serde(default)]
    pub vaults: Vec<VaultConfig>,
}

/// Global configuration settings.
#[derive(Debug, Default, Deserialize)]
pub struct GlobalConfig {
    /// Log level
    pub log_level: Option<String>,
    /// Oracle quotes older than this abort operations
    pub max_price_age_secs: Option<i64>,
    /// Ecosystem fee on positive yield, in basis points
    pub ecosystem_fee_bps: Option<u64>,
    /// Treasury fee on positive yield, in basis points
    pub treasury_fee_bps: Option<u64>,
    /// Per-asset flush composition guard, in basis points (10000 disables)
    pub flush_ratio_guard_bps: Option<u64>,
    /// Consecutive harvest failures before decommissioning
    pub max_adapter_failures: Option<u32>,
}

/// Configuration for one asset group.
#[derive(Debug, Deserialize)]
pub struct AssetGroupConfig {
    /// Unique name for this group
    pub name: String,
    /// Assets in the group, positional everywhere downstream
    pub assets: Vec<AssetConfig>,
}

/// Configuration for one asset within a group.
#[derive(Debug, Deserialize)]
pub struct AssetConfig {
    /// Ticker symbol, also the oracle lookup key
    pub symbol: String,
    /// Base-unit decimals
    pub decimals: u8,
    /// Seed USD price for the in-memory oracle
    pub price_usd: f64,
}

/// Configuration for a single strategy.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    Simulated(SimulatedStrategyConfig),
}

/// Configuration for a simulated yield strategy.
#[derive(Debug, Deserialize)]
pub struct SimulatedStrategyConfig {
    /// Unique name for this strategy instance
    pub name: String,
    /// Asset group this strategy operates over
    pub group: String,
    /// Risk score in 0..=100
    #[serde(default = "default_risk_score")]
    pub risk_score: u8,
    /// Required deposit ratio, in whole tokens per asset
    pub ratio: Vec<f64>,
    /// Yield realized on the next harvest, parts per 10^12
    #[serde(default)]
    pub yield_ppt: i64,
}

fn default_risk_score() -> u8 {
    50
}

/// Configuration for one vault.
#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    /// Unique name for this vault
    pub name: String,
    /// Asset group the vault accepts
    pub group: String,
    /// Participating strategies, by name
    pub strategies: Vec<String>,
    /// Target allocation in basis points, positional with `strategies`
    pub allocation_bps: Vec<u64>,
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents =
            fs::read_to_string(&path).map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(s: &str) -> Result<Self, String> {
        toml::from_str(s).map_err(|e| format!("Failed to parse config: {}", e))
    }

    fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            max_price_age_secs: self
                .global
                .max_price_age_secs
                .unwrap_or(defaults.max_price_age_secs),
            ecosystem_fee_bps: self
                .global
                .ecosystem_fee_bps
                .unwrap_or(defaults.ecosystem_fee_bps),
            treasury_fee_bps: self
                .global
                .treasury_fee_bps
                .unwrap_or(defaults.treasury_fee_bps),
            flush_ratio_guard_bps: self
                .global
                .flush_ratio_guard_bps
                .unwrap_or(defaults.flush_ratio_guard_bps),
            max_adapter_failures: self
                .global
                .max_adapter_failures
                .unwrap_or(defaults.max_adapter_failures),
        }
    }

    /// Builds a running engine from the configuration: seeds the in-memory
    /// oracle, registers groups, simulated strategies and vaults. Also
    /// returns the adapters by strategy name so callers can steer yields.
    pub async fn build_engine(
        &self,
    ) -> EngineResult<(VaultEngine, HashMap<String, Arc<SimulatedYieldAdapter>>)> {
        let oracle = StaticPriceOracle::new();
        let mut builder = EngineBuilder::new().with_config(self.engine_config());

        let mut group_ids: HashMap<String, AssetGroupId> = HashMap::new();
        for group in &self.asset_groups {
            let assets = group
                .assets
                .iter()
                .map(|a| Asset {
                    symbol: a.symbol.clone(),
                    decimals: a.decimals,
                })
                .collect();
            let id = builder.add_asset_group(&group.name, assets)?;
            if group_ids.insert(group.name.clone(), id).is_some() {
                return Err(EngineError::Configuration(format!(
                    "duplicate asset group {}",
                    group.name
                )));
            }
            for a in &group.assets {
                let price = (a.price_usd * PRICE_PRECISION as f64).round() as u128;
                oracle.set_price(&a.symbol, price).await;
            }
        }

        let mut strategy_ids: HashMap<String, StrategyId> = HashMap::new();
        let mut adapters: HashMap<String, Arc<SimulatedYieldAdapter>> = HashMap::new();
        for strategy in &self.strategies {
            let StrategyConfig::Simulated(cfg) = strategy;
            let group_id = *group_ids.get(&cfg.group).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "strategy {} references unknown group {}",
                    cfg.name, cfg.group
                ))
            })?;
            let group_cfg = &self.asset_groups[group_id.0 as usize];
            if cfg.ratio.len() != group_cfg.assets.len() {
                return Err(EngineError::Configuration(format!(
                    "strategy {} has {} ratio entries for {} assets",
                    cfg.name,
                    cfg.ratio.len(),
                    group_cfg.assets.len()
                )));
            }
            // Whole-token ratio entries become base units per the group's
            // asset decimals.
            let ratio = cfg
                .ratio
                .iter()
                .zip(&group_cfg.assets)
                .map(|(&r, a)| (r * pow10(a.decimals) as f64).round() as u128)
                .collect();
            let decimals = group_cfg.assets.iter().map(|a| a.decimals).collect();
            let adapter = SimulatedYieldAdapter::new(&cfg.name, decimals, ratio);
            adapter.set_next_yield(cfg.yield_ppt as i128).await;
            let id = builder.add_strategy(&cfg.name, group_id, adapter.clone(), cfg.risk_score)?;
            if strategy_ids.insert(cfg.name.clone(), id).is_some() {
                return Err(EngineError::Configuration(format!(
                    "duplicate strategy {}",
                    cfg.name
                )));
            }
            adapters.insert(cfg.name.clone(), adapter);
        }

        for vault in &self.vaults {
            let group_id = *group_ids.get(&vault.group).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "vault {} references unknown group {}",
                    vault.name, vault.group
                ))
            })?;
            let mut strategies = Vec::with_capacity(vault.strategies.len());
            for name in &vault.strategies {
                strategies.push(*strategy_ids.get(name).ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "vault {} references unknown strategy {}",
                        vault.name, name
                    ))
                })?);
            }
            let allocation = AllocationVector {
                weights: vault.allocation_bps.clone(),
            };
            builder.add_vault(&vault.name, group_id, strategies, allocation)?;
        }

        Ok((builder.build(oracle), adapters))
    }
}

// =============================================================================
// Default Configuration
// =============================================================================

/// Returns a default configuration string for documentation.
pub fn default_config_template() -> &'static str {
    r#"# Vault Engine Configuration
#
# Declares the asset groups, yield strategies and vaults the engine runs.
# Prices seed the in-memory oracle; production deployments replace it with
# a live feed.

[global]
max_price_age_secs = 3600
ecosystem_fee_bps = 500
treasury_fee_bps = 300

[[asset_groups]]
name = "majors"

[[asset_groups.assets]]
symbol = "ETH"
decimals = 18
price_usd = 1208.16

[[asset_groups.assets]]
symbol = "BTC"
decimals = 8
price_usd = 16404.71

[[asset_groups.assets]]
symbol = "BNB"
decimals = 18
price_usd = 270.39

# Strategies to run
[[strategies]]
type = "simulated"
name = "Lending-Majors"
group = "majors"
risk_score = 20
ratio = [1.0, 0.074, 4.5]
yield_ppt = 10000000000       # +1%

[[strategies]]
type = "simulated"
name = "AMM-Majors"
group = "majors"
risk_score = 55
ratio = [1.0, 0.070, 4.4]
yield_ppt = 25000000000       # +2.5%

[[strategies]]
type = "simulated"
name = "Staking-Majors"
group = "majors"
risk_score = 35
ratio = [1.0, 0.076, 4.6]
yield_ppt = 4000000000        # +0.4%

[[vaults]]
name = "balanced"
group = "majors"
strategies = ["Lending-Majors", "AMM-Majors", "Staking-Majors"]
allocation_bps = [6000, 3000, 1000]
"#
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_config() {
        let config_str = r#"
            [global]
            ecosystem_fee_bps = 400

            [[asset_groups]]
            name = "stables"
            assets = [
                { symbol = "USDC", decimals = 6, price_usd = 1.0 },
                { symbol = "DAI", decimals = 18, price_usd = 1.0 },
            ]

            [[strategies]]
            type = "simulated"
            name = "Lending-Stables"
            group = "stables"
            risk_score = 10
            ratio = [1.0, 1.0]

            [[vaults]]
            name = "conservative"
            group = "stables"
            strategies = ["Lending-Stables"]
            allocation_bps = [10000]
        "#;

        let config = Config::from_str(config_str).unwrap();
        assert_eq!(config.global.ecosystem_fee_bps, Some(400));
        assert_eq!(config.asset_groups.len(), 1);
        assert_eq!(config.strategies.len(), 1);
        assert_eq!(config.vaults.len(), 1);

        let StrategyConfig::Simulated(c) = &config.strategies[0];
        assert_eq!(c.name, "Lending-Stables");
        assert_eq!(c.risk_score, 10);
    }

    #[test]
    fn test_template_parses() {
        let config = Config::from_str(default_config_template()).unwrap();
        assert_eq!(config.asset_groups[0].assets.len(), 3);
        assert_eq!(config.strategies.len(), 3);
        assert_eq!(config.vaults[0].allocation_bps, vec![6000, 3000, 1000]);
    }

    #[tokio::test]
    async fn test_build_engine_from_template() {
        let config = Config::from_str(default_config_template()).unwrap();
        let (engine, adapters) = config.build_engine().await.unwrap();
        assert_eq!(engine.store().groups.len(), 1);
        assert_eq!(engine.store().strategies.len(), 3);
        assert_eq!(engine.store().vaults.len(), 1);
        assert!(adapters.contains_key("Lending-Majors"));
    }

    #[tokio::test]
    async fn test_unknown_strategy_reference() {
        let config_str = r#"
            [[asset_groups]]
            name = "stables"
            assets = [{ symbol = "USDC", decimals = 6, price_usd = 1.0 }]

            [[vaults]]
            name = "broken"
            group = "stables"
            strategies = ["Nope"]
            allocation_bps = [10000]
        "#;
        let config = Config::from_str(config_str).unwrap();
        assert!(matches!(
            config.build_engine().await,
            Err(EngineError::Configuration(_))
        ));
    }
}
