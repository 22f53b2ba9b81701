// Configuration: CLI flags, config.json sections, env fallbacks

use anyhow::{bail, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Simulation, // simulated trades only
    Live,       // simulated trades mirrored onto the exchange
}

/// How live entries are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Market,
    LimitGtx,
}

impl EntryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMode::Market => "MARKET",
            EntryMode::LimitGtx => "LIMIT_GTX",
        }
    }
}

/// CLI configuration
#[derive(Parser, Debug)]
#[command(name = "perp-trigger-trader")]
#[command(about = "Real-time perp-futures trigger/breakout engine with ROI-based trade simulation")]
pub struct CliConfig {
    /// Configuration file path (JSON format)
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,

    /// Comma-separated symbol universe (e.g. BTCUSDT,ETHUSDT)
    #[arg(long)]
    pub symbols: Option<String>,

    /// Run in simulation mode (default; no real orders)
    #[arg(long, default_value_t = true)]
    pub simulation: bool,

    /// Mirror simulated decisions onto the exchange (requires credentials)
    #[arg(long)]
    pub live: bool,

    /// Tick cadence override in milliseconds
    #[arg(long)]
    pub render_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// JSON file shape (all optional; defaults fill the gaps)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonConfig {
    pub symbols: Option<Vec<String>>,
    #[serde(rename = "market_symbol_overrides")]
    pub market_symbol_overrides: Option<HashMap<String, String>>,
    pub stream: Option<StreamJson>,
    pub candles: Option<CandlesJson>,
    pub flow: Option<FlowJson>,
    pub trigger: Option<TriggerJson>,
    pub sim: Option<SimJson>,
    pub live: Option<LiveJson>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamJson {
    pub render_interval_ms: Option<u64>,
    pub ws_ping_interval_ms: Option<u64>,
    pub ws_stale_timeout_ms: Option<i64>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandlesJson {
    pub history_candles: Option<usize>,
    pub history_interval: Option<String>,
    pub decision_window_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowJson {
    pub flow_lookback_ms: Option<i64>,
    pub flow_min_samples: Option<usize>,
    pub flow_confirm_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerJson {
    pub trigger_min_pct: Option<f64>,
    pub trigger_max_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimJson {
    pub margin_usd: Option<f64>,
    pub leverage: Option<f64>,
    pub sl_roi_min_pct: Option<f64>,
    pub sl_roi_max_pct: Option<f64>,
    pub trail_activate_roi_min_pct: Option<f64>,
    pub trail_activate_roi_max_pct: Option<f64>,
    pub trail_dd_roi_min_pct: Option<f64>,
    pub trail_dd_roi_max_pct: Option<f64>,
    pub min_net_profit_usd: Option<f64>,
    pub fee_rate_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveJson {
    pub enable: Option<bool>,
    pub testnet: Option<bool>,
    pub force_isolated: Option<bool>,
    pub entry_mode: Option<String>,
    pub gtx_timeout_ms: Option<u64>,
    pub gtx_poll_ms: Option<u64>,
    pub gtx_fallback_market: Option<bool>,
    pub spread_max_bps_default: Option<f64>,
    pub spread_max_bps: Option<HashMap<String, f64>>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub render_interval_ms: u64,
    pub ws_ping_interval_ms: u64,
    pub ws_stale_timeout_ms: i64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CandleConfig {
    pub history_candles: usize,
    pub history_interval: String,
    pub decision_window_ms: i64,
}

impl CandleConfig {
    /// Decision-timeframe length in milliseconds, derived from the interval.
    pub fn cycle_ms(&self) -> i64 {
        interval_ms(&self.history_interval).unwrap_or(300_000)
    }
}

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub flow_lookback_ms: i64,
    pub flow_min_samples: usize,
    pub flow_confirm_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub trigger_min_pct: f64,
    pub trigger_max_pct: f64,
}

/// Simulator risk parameters; the `_min`/`_max` pairs are interpolated
/// against the setup trigger at entry.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub margin_usd: f64,
    pub leverage: f64,
    pub sl_roi_min_pct: f64,
    pub sl_roi_max_pct: f64,
    pub trail_activate_roi_min_pct: f64,
    pub trail_activate_roi_max_pct: f64,
    pub trail_dd_roi_min_pct: f64,
    pub trail_dd_roi_max_pct: f64,
    pub min_net_profit_usd: f64,
    pub fee_rate_pct: f64,
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub enable: bool,
    pub testnet: bool,
    pub force_isolated: bool,
    pub entry_mode: EntryMode,
    pub gtx_timeout_ms: u64,
    pub gtx_poll_ms: u64,
    pub gtx_fallback_market: bool,
    pub spread_max_bps_default: f64,
    pub spread_max_bps: HashMap<String, f64>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl LiveConfig {
    pub fn rest_base_url(&self) -> &'static str {
        if self.testnet {
            "https://testnet.binancefuture.com"
        } else {
            "https://fapi.binance.com"
        }
    }

    pub fn ws_base_url(&self) -> &'static str {
        if self.testnet {
            "wss://stream.binancefuture.com"
        } else {
            "wss://fstream.binance.com"
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Per-symbol spread cap with the default as fallback.
    pub fn spread_cap_bps(&self, symbol: &str) -> f64 {
        self.spread_max_bps
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(self.spread_max_bps_default)
    }
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub market_symbol_overrides: HashMap<String, String>,
    pub stream: StreamConfig,
    pub candles: CandleConfig,
    pub flow: FlowConfig,
    pub trigger: TriggerConfig,
    pub sim: SimConfig,
    pub live: LiveConfig,
}

impl AppConfig {
    pub fn mode(&self) -> Mode {
        if self.live.enable {
            Mode::Live
        } else {
            Mode::Simulation
        }
    }

    /// Venue symbol for a configured display symbol (override or identity).
    pub fn market_symbol(&self, symbol: &str) -> String {
        self.market_symbol_overrides
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }
}

impl CliConfig {
    /// Load configuration from the JSON file (absent file is fine).
    pub fn load_json_config(&self) -> Result<JsonConfig> {
        if !self.config.exists() {
            return Ok(JsonConfig::default());
        }
        let content = fs::read_to_string(&self.config)?;
        let json: JsonConfig = serde_json::from_str(&content)?;
        Ok(json)
    }

    /// Merge CLI flags, the JSON file, env fallbacks, and defaults.
    pub fn resolve(&self) -> Result<AppConfig> {
        let json = self.load_json_config()?;

        // Universe: CLI csv > JSON list > SYMBOLS env > default pair
        let symbols: Vec<String> = self
            .symbols
            .clone()
            .map(|csv| csv.split(',').map(|s| s.trim().to_uppercase()).collect())
            .or_else(|| {
                json.symbols
                    .clone()
                    .map(|v| v.iter().map(|s| s.to_uppercase()).collect())
            })
            .or_else(|| {
                std::env::var("SYMBOLS")
                    .ok()
                    .map(|csv| csv.split(',').map(|s| s.trim().to_uppercase()).collect())
            })
            .unwrap_or_else(|| vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let symbols: Vec<String> = symbols.into_iter().filter(|s| !s.is_empty()).collect();
        if symbols.is_empty() {
            bail!("symbol universe is empty");
        }

        let stream_json = json.stream.clone().unwrap_or_default();
        let stream = StreamConfig {
            render_interval_ms: self
                .render_interval_ms
                .or(stream_json.render_interval_ms)
                .unwrap_or(1000),
            ws_ping_interval_ms: stream_json.ws_ping_interval_ms.unwrap_or(15_000),
            ws_stale_timeout_ms: stream_json.ws_stale_timeout_ms.unwrap_or(45_000),
            reconnect_base_ms: stream_json.reconnect_base_ms.unwrap_or(1_000),
            reconnect_max_ms: stream_json.reconnect_max_ms.unwrap_or(15_000),
        };

        let candles_json = json.candles.clone().unwrap_or_default();
        let candles = CandleConfig {
            history_candles: candles_json.history_candles.unwrap_or(72),
            history_interval: candles_json.history_interval.unwrap_or_else(|| "5m".into()),
            decision_window_ms: candles_json.decision_window_ms.unwrap_or(300_000),
        };
        if interval_ms(&candles.history_interval).is_none() {
            bail!("unsupported history interval: {}", candles.history_interval);
        }

        let flow_json = json.flow.clone().unwrap_or_default();
        let flow = FlowConfig {
            flow_lookback_ms: flow_json.flow_lookback_ms.unwrap_or(60_000),
            flow_min_samples: flow_json.flow_min_samples.unwrap_or(20),
            flow_confirm_threshold: flow_json.flow_confirm_threshold.unwrap_or(0.08),
        };

        let trigger_json = json.trigger.clone().unwrap_or_default();
        let trigger = TriggerConfig {
            trigger_min_pct: trigger_json.trigger_min_pct.unwrap_or(0.05),
            trigger_max_pct: trigger_json.trigger_max_pct.unwrap_or(1.2),
        };

        let sim_json = json.sim.clone().unwrap_or_default();
        let sim = SimConfig {
            margin_usd: sim_json.margin_usd.unwrap_or(10.0),
            leverage: sim_json.leverage.unwrap_or(20.0),
            sl_roi_min_pct: sim_json.sl_roi_min_pct.unwrap_or(8.0),
            sl_roi_max_pct: sim_json.sl_roi_max_pct.unwrap_or(15.0),
            trail_activate_roi_min_pct: sim_json.trail_activate_roi_min_pct.unwrap_or(10.0),
            trail_activate_roi_max_pct: sim_json.trail_activate_roi_max_pct.unwrap_or(20.0),
            trail_dd_roi_min_pct: sim_json.trail_dd_roi_min_pct.unwrap_or(4.0),
            trail_dd_roi_max_pct: sim_json.trail_dd_roi_max_pct.unwrap_or(8.0),
            min_net_profit_usd: sim_json.min_net_profit_usd.unwrap_or(0.05),
            fee_rate_pct: sim_json.fee_rate_pct.unwrap_or(0.05),
        };

        let live_json = json.live.clone().unwrap_or_default();
        let entry_mode = match live_json
            .entry_mode
            .as_deref()
            .unwrap_or("MARKET")
            .to_uppercase()
            .as_str()
        {
            "MARKET" => EntryMode::Market,
            "LIMIT_GTX" => EntryMode::LimitGtx,
            other => bail!("unsupported live entry mode: {other}"),
        };
        let live = LiveConfig {
            enable: self.live || live_json.enable.unwrap_or(false),
            testnet: live_json.testnet.unwrap_or(false),
            force_isolated: live_json.force_isolated.unwrap_or(true),
            entry_mode,
            gtx_timeout_ms: live_json.gtx_timeout_ms.unwrap_or(4_000),
            gtx_poll_ms: live_json.gtx_poll_ms.unwrap_or(250),
            gtx_fallback_market: live_json.gtx_fallback_market.unwrap_or(true),
            spread_max_bps_default: live_json.spread_max_bps_default.unwrap_or(6.0),
            spread_max_bps: live_json
                .spread_max_bps
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
            api_key: live_json
                .api_key
                .or_else(|| std::env::var("BINANCE_API_KEY").ok())
                .filter(|k| !k.is_empty()),
            api_secret: live_json
                .api_secret
                .or_else(|| std::env::var("BINANCE_API_SECRET").ok())
                .filter(|s| !s.is_empty()),
        };

        Ok(AppConfig {
            symbols,
            market_symbol_overrides: json.market_symbol_overrides.unwrap_or_default(),
            stream,
            candles,
            flow,
            trigger,
            sim,
            live,
        })
    }
}

/// Parse a kline interval like "1m", "5m", "1h" into milliseconds.
pub fn interval_ms(interval: &str) -> Option<i64> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (value, unit) = interval.split_at(interval.len() - 1);
    let value: i64 = value.parse().ok()?;
    if value <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(value * unit_ms)
}
