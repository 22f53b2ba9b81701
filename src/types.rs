// Core types used throughout the trading engine

use std::collections::VecDeque;

/// One candle on the decision timeframe.
///
/// Candles come either from the boot-time history hydration or from closed
/// kline events on the stream. Within a symbol's ring `close_time` is
/// strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Aggressor side of an aggregated trade (sell iff the buyer was the maker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One aggregated trade kept in the rolling flow window.
#[derive(Debug, Clone, Copy)]
pub struct AggTrade {
    pub ts: i64,
    pub qty: f64,
    pub side: TradeSide,
}

/// Decoded market event, keyed by lowercase market symbol.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade {
        symbol: String,
        price: f64,
        qty: f64,
        ts: i64,
        side: TradeSide,
    },
    Mark {
        symbol: String,
        price: f64,
        ts: i64,
    },
    Kline {
        symbol: String,
        candle: Candle,
        is_closed: bool,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade { symbol, .. } => symbol,
            MarketEvent::Mark { symbol, .. } => symbol,
            MarketEvent::Kline { symbol, .. } => symbol,
        }
    }
}

/// Classification of a symbol's current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionStatus {
    Wait,
    Sideways,
    Setup,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Wait => "WAIT",
            DecisionStatus::Sideways => "SIDEWAYS",
            DecisionStatus::Setup => "SETUP",
        }
    }
}

/// Pure output of the strategy analyzer for one symbol at one instant.
#[derive(Debug, Clone)]
pub struct DecisionAnalysis {
    pub status: DecisionStatus,
    pub reason: String,
    pub long_above: Option<f64>,
    pub short_below: Option<f64>,
    pub trigger_pct: f64,
    pub flow_imbalance: Option<f64>,
    pub flow_samples: Option<usize>,
}

impl DecisionAnalysis {
    /// Shorthand for the WAIT preconditions.
    pub fn wait(reason: impl Into<String>) -> Self {
        Self {
            status: DecisionStatus::Wait,
            reason: reason.into(),
            long_above: None,
            short_below: None,
            trigger_pct: 0.0,
            flow_imbalance: None,
            flow_samples: None,
        }
    }
}

/// Cycle-scoped decision plan.
///
/// `cycle_id` equals the next candle close timestamp; at most one plan exists
/// per (symbol, cycle). Once the plan reaches SETUP its trigger thresholds
/// are frozen until the cycle ends. `has_triggered` is latched by the
/// simulator when the plan fires so a cycle never fires twice.
#[derive(Debug, Clone)]
pub struct DecisionPlan {
    pub cycle_id: i64,
    pub status: DecisionStatus,
    pub reason: String,
    pub trigger_pct: f64,
    pub flow_imbalance: Option<f64>,
    pub flow_samples: Option<usize>,
    pub base_price: f64,
    pub long_above: f64,
    pub short_below: f64,
    pub created_at: i64,
    pub has_triggered: bool,
}

/// Direction of a simulated or live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

/// Why a simulated trade closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    SlRoi,
    TrailRoi,
    LockProfit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::SlRoi => "SL_ROI",
            ExitReason::TrailRoi => "TRAIL_ROI",
            ExitReason::LockProfit => "LOCK_PROFIT",
        }
    }
}

/// One open simulated trade. Risk parameters are fixed at entry by
/// interpolating the configured min/max pairs against the setup trigger.
#[derive(Debug, Clone)]
pub struct ActiveTrade {
    pub side: PositionSide,
    pub entry_price: f64,
    pub entry_time: i64,
    pub margin_usd: f64,
    pub leverage: f64,
    pub position_value_usd: f64,
    pub quantity: f64,
    pub stop_loss_roi_pct: f64,
    pub trail_activate_roi_pct: f64,
    pub trail_dd_roi_pct: f64,
    pub min_net_profit_usd: f64,
    pub fee_rate_pct: f64,
    pub entry_fee_usd: f64,
    /// Estimate from entry notional; the realized exit fee is recomputed
    /// from exit notional at close. Kept for diagnostics.
    pub estimated_exit_fee_usd: f64,
    pub trailing_armed: bool,
    pub peak_net_pnl_usd: f64,
    pub peak_roi_pct: f64,
    /// Free-form note carried from the plan (reason, trigger).
    pub meta: String,
}

/// Snapshot of a finished simulated trade.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub side: PositionSide,
    pub entry_price: f64,
    pub entry_time: i64,
    pub exit_price: f64,
    pub exit_time: i64,
    pub exit_reason: ExitReason,
    pub margin_usd: f64,
    pub leverage: f64,
    pub quantity: f64,
    pub gross_pnl_usd: f64,
    pub fees_usd: f64,
    pub pnl_usd: f64,
    pub roi_pct: f64,
    pub is_win: bool,
}

/// Aggregate statistics over closed simulated trades.
#[derive(Debug, Default, Clone)]
pub struct TradingStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub realized_pnl_usd: f64,
}

/// Rolling per-symbol market state owned by the engine's store.
#[derive(Debug, Default)]
pub struct SymbolState {
    pub candles: VecDeque<Candle>,
    pub flow: VecDeque<AggTrade>,
    pub trade_price: Option<f64>,
    pub trade_qty: Option<f64>,
    pub trade_ts: Option<i64>,
    pub mark_price: Option<f64>,
    pub mark_ts: Option<i64>,
    pub last_volume_5m: Option<f64>,
    pub next_candle_close_ts: Option<i64>,
    pub last_stream_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Net taker flow over the window: (buy − sell) / (buy + sell), plus the
/// sample count the imbalance was computed from.
#[derive(Debug, Clone, Copy)]
pub struct FlowContext {
    pub imbalance: f64,
    pub samples: usize,
}
