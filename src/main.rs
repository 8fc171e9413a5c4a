// src/main.rs
//
// Batch vault engine with multi-strategy settlement. Deposits queue against
// a flush cycle, flushes divide capital across strategies, harvests invest
// and measure yield, synchronization settles vault shares.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use vault_engine::allocation::LinearAllocationProvider;
use vault_engine::config::{default_config_template, Config};
use vault_engine::models::{pow10, Basket, StrategyId, VaultId};

#[derive(Parser)]
#[command(name = "vault-engine")]
#[command(about = "Batching and settlement engine for multi-strategy asset vaults")]
struct Args {
    /// Mode of operation
    #[arg(long, default_value = "demo")]
    mode: String,

    /// Path to configuration file (TOML)
    #[arg(long, short)]
    config: Option<String>,

    /// Risk tolerance for allocation suggestions (-10..=10)
    #[arg(long, default_value = "0")]
    risk_tolerance: i8,

    /// Generate a default configuration file
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    // Handle config generation
    if args.generate_config {
        println!("{}", default_config_template());
        return;
    }

    match args.mode.as_str() {
        "demo" => {
            if let Err(e) = run_demo_mode(&args).await {
                eprintln!("Demo failed: {:#}", e);
                std::process::exit(1);
            }
        }
        _ => {
            eprintln!("Unknown mode: {}. Use: demo", args.mode);
            std::process::exit(1);
        }
    }
}

// =============================================================================
// Demo Mode: One full deposit/flush/harvest/sync/withdraw round
// =============================================================================

async fn run_demo_mode(args: &Args) -> Result<()> {
    println!("Starting Vault Engine Demo...");

    let config = match &args.config {
        Some(path) => Config::from_file(path).map_err(|e| anyhow!(e))?,
        None => Config::from_str(default_config_template()).map_err(|e| anyhow!(e))?,
    };
    let (engine, _adapters) = config
        .build_engine()
        .await
        .context("building engine from config")?;

    let vault = VaultId(0);
    let group = engine.store().group(engine.store().vault(vault)?.group)?;
    println!(
        "Vault '{}' over group '{}' ({} assets, {} strategies)",
        engine.store().vault(vault)?.name,
        group.name,
        group.asset_count(),
        engine.store().vault(vault)?.strategies.len()
    );

    // Deposit one whole token of each asset.
    let amounts = group.assets.iter().map(|a| pow10(a.decimals)).collect();
    let deposit_id = engine
        .request_deposit(vault, "demo-account", Basket::new(amounts))
        .await?;
    let flush_index = engine.flush(vault).await?;
    println!("Flushed cycle {}", flush_index - 1);

    for i in 0..engine.store().strategies.len() {
        let sid = StrategyId(i as u32);
        let index = engine.harvest(sid).await?;
        println!("Harvested {} up to index {}", engine.store().strategy(sid)?.name, index);
    }

    engine.synchronize(vault).await?;
    let shares = engine.claim_deposit(vault, deposit_id, "demo-account").await?;
    let value = engine.vault_value(vault).await?;
    println!(
        "{}",
        json!({
            "event": "deposit_settled",
            "vault_shares": shares.to_string(),
            "vault_value_usd_e8": value.to_string(),
        })
    );

    // Withdraw half and run a second cycle.
    let withdrawal_id = engine
        .request_withdrawal(vault, "demo-account", shares / 2)
        .await?;
    engine.flush(vault).await?;
    for i in 0..engine.store().strategies.len() {
        engine.harvest(StrategyId(i as u32)).await?;
    }
    engine.synchronize(vault).await?;
    let basket = engine
        .claim_withdrawal(vault, withdrawal_id, "demo-account")
        .await?;
    println!(
        "{}",
        json!({
            "event": "withdrawal_settled",
            "amounts": basket.amounts.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        })
    );

    // Ask the linear provider for a refreshed allocation and apply it.
    let provider = LinearAllocationProvider;
    let suggested = engine
        .suggest_allocation(vault, &provider, args.risk_tolerance)
        .await?;
    let applied = engine.reallocate(vault, suggested).await?;
    println!(
        "{}",
        json!({
            "event": "reallocated",
            "allocation_bps": applied.weights,
        })
    );

    Ok(())
}
