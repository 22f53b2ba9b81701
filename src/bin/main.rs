// Main entry point for the perp trigger/breakout trading engine

use anyhow::Result;
use perp_trigger_trading::config::{CliConfig, Mode};
use perp_trigger_trading::engine::Engine;
use perp_trigger_trading::feed::{spawn_feed, FeedSettings};
use perp_trigger_trading::store::{StoreLimits, SymbolStore};
use perp_trigger_trading::trading::LiveTrader;
use perp_trigger_trading::{init_history_file, log_trading_event, FuturesApi};
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 2_048;

#[tokio::main]
async fn main() -> Result<()> {
    // Open the history log for append and initialize the global writer
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("history.log")?;
    init_history_file(log_file);

    // Initialize logging (tracing to stderr)
    tracing_subscriber::fmt::init();

    let cli = <CliConfig as clap::Parser>::parse();
    let cfg = match cli.resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("❌ Configuration error: {e}");
            std::process::exit(1);
        }
    };

    println!("🚀 Starting perp trigger/breakout engine");
    println!("📝 Events are journaled to: history.log");
    println!("Mode          : {:?}", cfg.mode());
    println!("Symbols       : {:?}", cfg.symbols);
    println!("Interval      : {}", cfg.candles.history_interval);
    println!("Tick cadence  : {} ms", cfg.stream.render_interval_ms);
    if cfg.mode() == Mode::Live {
        println!("Entry mode    : {}", cfg.live.entry_mode.as_str());
        println!("Testnet       : {}", cfg.live.testnet);
    }
    log_trading_event(&format!(
        "ENGINE START | mode={:?} | symbols={:?} | interval={} | cadence_ms={}",
        cfg.mode(),
        cfg.symbols,
        cfg.candles.history_interval,
        cfg.stream.render_interval_ms
    ));
    info!("🚀 starting engine, mode={:?}", cfg.mode());

    let market_symbols: Vec<String> = cfg
        .symbols
        .iter()
        .map(|s| cfg.market_symbol(s))
        .collect();
    let store_keys: Vec<String> = market_symbols.iter().map(|s| s.to_lowercase()).collect();

    let api = Arc::new(FuturesApi::new(
        cfg.live.rest_base_url(),
        cfg.live.api_key.clone(),
        cfg.live.api_secret.clone(),
    ));

    // Seed candle history so the analyzer does not wait a full ring's worth
    // of cycles before its first decision.
    let limits = StoreLimits {
        history_candles: cfg.candles.history_candles,
        flow_lookback_ms: cfg.flow.flow_lookback_ms,
        cycle_ms: cfg.candles.cycle_ms(),
    };
    let mut store = SymbolStore::new(&store_keys, limits);
    println!("🔍 Hydrating {} candles per symbol...", cfg.candles.history_candles);
    for (market, key) in market_symbols.iter().zip(&store_keys) {
        match api
            .fetch_klines(market, &cfg.candles.history_interval, cfg.candles.history_candles)
            .await
        {
            Ok(candles) => {
                info!("hydrated {} with {} candles", market, candles.len());
                if let Some(state) = store.get_mut(key) {
                    state.seed_candles(candles, &limits);
                }
            }
            Err(e) => {
                // The engine still runs; the symbol shows its error until the
                // stream fills the ring.
                warn!("⚠️  history hydration failed for {market}: {e}");
                if let Some(state) = store.get_mut(key) {
                    state.last_error = Some(format!("hydration failed: {e}"));
                }
            }
        }
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let feed = spawn_feed(
        FeedSettings {
            ws_base_url: cfg.live.ws_base_url().to_string(),
            market_symbols: store_keys.clone(),
            kline_interval: cfg.candles.history_interval.clone(),
            ping_interval_ms: cfg.stream.ws_ping_interval_ms,
            reconnect_base_ms: cfg.stream.reconnect_base_ms,
            reconnect_max_ms: cfg.stream.reconnect_max_ms,
        },
        event_tx,
    );

    // Live mirroring is best-effort: missing credentials or a failed
    // bootstrap disable it and the simulation keeps running.
    let live = if cfg.live.enable {
        if !cfg.live.has_credentials() {
            let msg = "⚠️  LIVE DISABLED | missing API credentials, running simulation only";
            println!("{msg}");
            warn!("{msg}");
            log_trading_event(msg);
            None
        } else {
            warn!("⚠️  live trading enabled: real orders will be sent");
            let trader = Arc::new(LiveTrader::new(
                api.clone(),
                cfg.live.clone(),
                cfg.sim.margin_usd,
                cfg.sim.leverage.round().max(1.0) as u32,
            ));
            match trader.bootstrap(&market_symbols).await {
                Ok(()) => Some(trader),
                Err(e) => {
                    let msg = format!("⚠️  LIVE DISABLED | bootstrap failed: {e}");
                    println!("{msg}");
                    error!("{msg}");
                    log_trading_event(&msg);
                    None
                }
            }
        }
    } else {
        None
    };

    let engine = Engine::new(cfg, store, feed, event_rx, live);
    engine.run().await
}
