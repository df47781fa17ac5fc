mod bybit_api;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;

use smc_trader::candles::normalize_symbol;
use smc_trader::config::{pool_window, POOL_FETCH_PADDING};
use smc_trader::liquidity::LiquidationCache;
use smc_trader::range_breakout::scan_range_setups;
use smc_trader::scan::run_cycle;
use smc_trader::tools::{execute_json, ToolContext};
use smc_trader::types::OpenPosition;
use smc_trader::{Interval, JsonFileStore, MemoryCandleSource, PositionTracker, StrategyConfig};

use bybit_api::{BybitClient, MAX_KLINE_LIMIT};

/// Concurrent kline requests during prefetch.
const PREFETCH_CONCURRENCY: usize = 8;

#[derive(Parser)]
#[command(name = "smc_trader", version, about = "Smart-money liquidity scanner")]
struct Cli {
    /// TOML strategy config; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Comma-separated symbols overriding the config list.
    #[arg(long, global = true, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Persisted position state.
    #[arg(long, global = true, default_value = "position_state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One full cycle: sync, manage, then signal + MTF + sizing per symbol.
    Scan {
        /// Account balance in USD.
        #[arg(long)]
        balance: f64,
        /// JSON array of open positions ({symbol, size, mark_price?}).
        #[arg(long)]
        positions: Option<PathBuf>,
    },
    /// NY-midnight range breakout check for every symbol.
    Range,
    /// Run one JSON operation; reads stdin when no argument is given.
    Tool { request: Option<String> },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => StrategyConfig::load(path)?,
        None => StrategyConfig::default(),
    };
    if !cli.symbols.is_empty() {
        cfg.symbols = cli.symbols.clone();
    }
    cfg.symbols = cfg.symbols.iter().map(|s| normalize_symbol(s)).collect();

    let bybit = BybitClient::new()?;

    match cli.command {
        Command::Scan { balance, positions } => {
            let open: Option<Vec<OpenPosition>> = match positions {
                Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };
            let mut symbols = cfg.symbols.clone();
            if let Some(open) = &open {
                symbols.extend(open.iter().map(|p| normalize_symbol(&p.symbol)));
            }
            let source = prefetch(&bybit, &symbols, prefetch_limit(&cfg)).await;

            let mut tracker = PositionTracker::new(JsonFileStore::new(&cli.state));
            let report = run_cycle(&source, &mut tracker, &cfg, balance, open.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Range => {
            let source = prefetch(&bybit, &cfg.symbols, prefetch_limit(&cfg)).await;
            let scan = scan_range_setups(&source, &cfg.symbols, Utc::now());
            println!("{}", serde_json::to_string_pretty(&scan)?);
        }
        Command::Tool { request } => {
            let raw = match request {
                Some(r) => r,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let mut symbols = cfg.symbols.clone();
            symbols.extend(request_symbols(&raw));
            let source = prefetch(&bybit, &symbols, prefetch_limit(&cfg)).await;

            let mut tracker = PositionTracker::new(JsonFileStore::new(&cli.state));
            let mut cache = LiquidationCache::default();
            let mut ctx = ToolContext {
                source: &source,
                tracker: &mut tracker,
                cache: &mut cache,
                config: &cfg,
                now: Utc::now(),
            };
            let response = execute_json(&raw, &mut ctx);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

/// Deepest history any analysis step asks for, capped at one kline page.
/// Symbols a tool request names, through `symbol` or a `symbols` list.
fn request_symbols(raw: &str) -> Vec<String> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    let listed = v["symbols"].as_array().into_iter().flatten().filter_map(|s| s.as_str());
    v["symbol"].as_str().into_iter().chain(listed).map(normalize_symbol).collect()
}

fn prefetch_limit(cfg: &StrategyConfig) -> usize {
    cfg.signal_candles
        .max(pool_window(Interval::H1) + POOL_FETCH_PADDING)
        .min(MAX_KLINE_LIMIT)
}

/// Loads every symbol on every interval into memory. A failed series is
/// logged and left out; analysis of that symbol then reports it unavailable.
async fn prefetch(bybit: &BybitClient, symbols: &[String], limit: usize) -> MemoryCandleSource {
    let mut symbols: Vec<String> = symbols.to_vec();
    symbols.sort();
    symbols.dedup();

    let sem = Arc::new(Semaphore::new(PREFETCH_CONCURRENCY));
    let intervals = [Interval::M5, Interval::M15, Interval::H1, Interval::H4];
    log::info!(
        "Pre-loading {} candles × {} symbols × {} TFs via REST…",
        limit,
        symbols.len(),
        intervals.len()
    );

    let handles: Vec<_> = symbols
        .iter()
        .flat_map(|symbol| {
            let sem = sem.clone();
            let bybit = bybit.clone();
            intervals.into_iter().map(move |tf| {
                let sem = sem.clone();
                let bybit = bybit.clone();
                let symbol = symbol.clone();
                tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.ok()?;
                    match bybit.fetch_klines(&symbol, tf, limit).await {
                        Ok(candles) => {
                            log::info!("[{} {}] pre-loaded {} candles", symbol, tf, candles.len());
                            Some((symbol, tf, candles))
                        }
                        Err(e) => {
                            log::warn!("[{} {}] prefetch failed: {}", symbol, tf, e);
                            None
                        }
                    }
                })
            })
        })
        .collect();

    let mut source = MemoryCandleSource::new();
    for h in handles {
        match h.await {
            Ok(Some((symbol, tf, candles))) => source.insert(&symbol, tf, candles),
            Ok(None) => {}
            Err(e) => log::warn!("prefetch task failed: {}", e),
        }
    }
    source
}
