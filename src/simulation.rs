// Simulated trade state machine: ROI-interpolated risk, deterministic closes

use crate::config::SimConfig;
use crate::types::{
    ActiveTrade, ClosedTrade, DecisionPlan, DecisionStatus, ExitReason, PositionSide, TradingStats,
};
use std::collections::VecDeque;
use tracing::info;

/// Trigger band the risk interpolation maps into.
const RISK_INTERP_LO_PCT: f64 = 0.08;
const RISK_INTERP_HI_PCT: f64 = 1.8;
/// Entry veto thresholds on the plan's flow imbalance.
const FLOW_GATE_MIN_SAMPLES: usize = 20;
const FLOW_GATE_IMBALANCE: f64 = 0.05;
/// Closed-trade history bound.
const HISTORY_LIMIT: usize = 30;
/// Round-trip fees are padded by this factor when deriving the profit floor.
const FEE_PROFIT_BUFFER: f64 = 1.25;

/// Per-symbol simulator state: at most one open trade, bounded history,
/// aggregate stats.
#[derive(Debug)]
pub struct SimState {
    symbol: String,
    pub active: Option<ActiveTrade>,
    pub history: VecDeque<ClosedTrade>,
    pub stats: TradingStats,
    pub last_closed: Option<ClosedTrade>,
}

/// Interpolate one risk parameter between its min/max against the setup
/// trigger mapped into [0.08, 1.8]; outside the band it clamps.
pub fn interpolate_risk(min: f64, max: f64, setup_trigger_pct: f64) -> f64 {
    let t = ((setup_trigger_pct - RISK_INTERP_LO_PCT) / (RISK_INTERP_HI_PCT - RISK_INTERP_LO_PCT))
        .clamp(0.0, 1.0);
    min + (max - min) * t
}

impl SimState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            active: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            stats: TradingStats::default(),
            last_closed: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Try to open a trade off a SETUP plan whose trigger level the live
    /// price has crossed. Latches `plan.has_triggered` on success so a cycle
    /// fires at most once.
    pub fn maybe_open_trade(
        &mut self,
        plan: &mut DecisionPlan,
        live_price: f64,
        now: i64,
        cfg: &SimConfig,
    ) -> Option<&ActiveTrade> {
        if self.active.is_some() {
            return None;
        }
        if plan.status != DecisionStatus::Setup || plan.has_triggered {
            return None;
        }
        if !finite_positive(live_price)
            || !finite_positive(plan.long_above)
            || !finite_positive(plan.short_below)
        {
            return None;
        }

        let side = if live_price >= plan.long_above {
            PositionSide::Long
        } else if live_price <= plan.short_below {
            PositionSide::Short
        } else {
            return None;
        };

        // Flow gate: a trusted imbalance leaning against the breakout vetoes it.
        if let (Some(imbalance), Some(samples)) = (plan.flow_imbalance, plan.flow_samples) {
            if imbalance.is_finite() && samples >= FLOW_GATE_MIN_SAMPLES {
                let vetoed = match side {
                    PositionSide::Long => imbalance < -FLOW_GATE_IMBALANCE,
                    PositionSide::Short => imbalance > FLOW_GATE_IMBALANCE,
                };
                if vetoed {
                    let msg = format!(
                        "[SIM] ⏸️  FLOW VETO | symbol={} | side={} | imbalance={:.3} | samples={}",
                        self.symbol,
                        side.as_str(),
                        imbalance,
                        samples
                    );
                    println!("{}", msg);
                    crate::log_trading_event(&msg);
                    return None;
                }
            }
        }

        let stop_loss_roi_pct =
            interpolate_risk(cfg.sl_roi_min_pct, cfg.sl_roi_max_pct, plan.trigger_pct);
        let trail_activate_roi_pct = interpolate_risk(
            cfg.trail_activate_roi_min_pct,
            cfg.trail_activate_roi_max_pct,
            plan.trigger_pct,
        );
        let trail_dd_roi_pct = interpolate_risk(
            cfg.trail_dd_roi_min_pct,
            cfg.trail_dd_roi_max_pct,
            plan.trigger_pct,
        );

        let position_value_usd = cfg.margin_usd * cfg.leverage;
        let quantity = position_value_usd / live_price;
        if !quantity.is_finite() || quantity <= 0.0 {
            return None;
        }

        let entry_fee_usd = position_value_usd * cfg.fee_rate_pct / 100.0;
        let estimated_exit_fee_usd = entry_fee_usd;
        let round_trip_fees = entry_fee_usd + estimated_exit_fee_usd;
        let min_net_profit_usd = cfg
            .min_net_profit_usd
            .max(round_trip_fees * FEE_PROFIT_BUFFER);

        let trade = ActiveTrade {
            side,
            entry_price: live_price,
            entry_time: now,
            margin_usd: cfg.margin_usd,
            leverage: cfg.leverage,
            position_value_usd,
            quantity,
            stop_loss_roi_pct,
            trail_activate_roi_pct,
            trail_dd_roi_pct,
            min_net_profit_usd,
            fee_rate_pct: cfg.fee_rate_pct,
            entry_fee_usd,
            estimated_exit_fee_usd,
            trailing_armed: false,
            // Peaks start net-of-entry so trailing never references the
            // fee-free gross.
            peak_net_pnl_usd: -round_trip_fees,
            peak_roi_pct: -round_trip_fees / cfg.margin_usd * 100.0,
            meta: format!("{} @ {:.2}%", plan.reason, plan.trigger_pct),
        };

        plan.has_triggered = true;

        let msg = format!(
            "[SIM] {} OPEN | symbol={} | side={} | entry={:.6} | qty={:.6} | margin={:.2} | lev={:.0} | sl={:.2}% | arm={:.2}% | dd={:.2}%",
            if side == PositionSide::Long { "🟢" } else { "🔴" },
            self.symbol,
            side.as_str(),
            live_price,
            quantity,
            cfg.margin_usd,
            cfg.leverage,
            stop_loss_roi_pct,
            trail_activate_roi_pct,
            trail_dd_roi_pct,
        );
        println!("{}", msg);
        info!(
            "[SIM] open {} {} entry={:.6} qty={:.6}",
            self.symbol,
            side.as_str(),
            live_price,
            quantity
        );
        crate::log_trading_event(&msg);

        self.active = Some(trade);
        self.active.as_ref()
    }

    /// Re-evaluate the open trade against a fresh price. Returns the closed
    /// trade when one of the exit rules fired this tick.
    pub fn update_open_trade(&mut self, live_price: f64, now: i64) -> Option<ClosedTrade> {
        if !finite_positive(live_price) {
            return None;
        }
        let trade = self.active.as_mut()?;

        let gross = gross_pnl(trade, live_price);
        let exit_fee = (trade.quantity * live_price).abs() * trade.fee_rate_pct / 100.0;
        let net = gross - (trade.entry_fee_usd + exit_fee);
        let roi_pct = net / trade.margin_usd * 100.0;

        // 1. Stop-loss has priority over everything else.
        if roi_pct <= -trade.stop_loss_roi_pct {
            return Some(self.close(live_price, now, ExitReason::SlRoi));
        }

        // 2. Track the high-water mark.
        if net > trade.peak_net_pnl_usd {
            trade.peak_net_pnl_usd = net;
            trade.peak_roi_pct = roi_pct;
        }

        // 3. Arming is sticky for the life of the trade.
        if roi_pct >= trade.trail_activate_roi_pct {
            trade.trailing_armed = true;
        }

        // 4. Trailing drawdown, only once profit has cleared the floor.
        if trade.trailing_armed
            && trade.peak_roi_pct - roi_pct >= trade.trail_dd_roi_pct
            && net >= trade.min_net_profit_usd
        {
            return Some(self.close(live_price, now, ExitReason::TrailRoi));
        }

        // 5. Lock-profit: peak cleared the floor but current net fell back.
        if trade.trailing_armed
            && trade.peak_net_pnl_usd >= trade.min_net_profit_usd
            && net <= trade.min_net_profit_usd
        {
            return Some(self.close(live_price, now, ExitReason::LockProfit));
        }

        None
    }

    /// Unrealized net P&L and ROI of the open trade at the given price.
    pub fn open_metrics(&self, live_price: f64) -> Option<(f64, f64)> {
        let trade = self.active.as_ref()?;
        if !finite_positive(live_price) {
            return None;
        }
        let gross = gross_pnl(trade, live_price);
        let exit_fee = (trade.quantity * live_price).abs() * trade.fee_rate_pct / 100.0;
        let net = gross - (trade.entry_fee_usd + exit_fee);
        Some((net, net / trade.margin_usd * 100.0))
    }

    fn close(&mut self, exit_price: f64, now: i64, reason: ExitReason) -> ClosedTrade {
        let trade = self.active.take().expect("close requires an active trade");

        let gross_pnl_usd = gross_pnl(&trade, exit_price);
        let exit_fee = (trade.quantity * exit_price).abs() * trade.fee_rate_pct / 100.0;
        let fees_usd = trade.entry_fee_usd + exit_fee;
        let pnl_usd = gross_pnl_usd - fees_usd;
        let roi_pct = pnl_usd / trade.margin_usd * 100.0;
        let is_win = pnl_usd > 0.0;

        let closed = ClosedTrade {
            side: trade.side,
            entry_price: trade.entry_price,
            entry_time: trade.entry_time,
            exit_price,
            exit_time: now,
            exit_reason: reason,
            margin_usd: trade.margin_usd,
            leverage: trade.leverage,
            quantity: trade.quantity,
            gross_pnl_usd,
            fees_usd,
            pnl_usd,
            roi_pct,
            is_win,
        };

        self.stats.total_trades += 1;
        if is_win {
            self.stats.winning_trades += 1;
        } else {
            self.stats.losing_trades += 1;
        }
        self.stats.realized_pnl_usd += pnl_usd;

        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(closed.clone());
        self.last_closed = Some(closed.clone());

        let msg = format!(
            "[SIM] {} CLOSE {} | symbol={} | side={} | entry={:.6} | exit={:.6} | pnl={:.4} | roi={:.2}% | fees={:.4} | {}",
            if is_win { "✅" } else { "❌" },
            reason.as_str(),
            self.symbol,
            closed.side.as_str(),
            closed.entry_price,
            closed.exit_price,
            closed.pnl_usd,
            closed.roi_pct,
            closed.fees_usd,
            if is_win { "WIN" } else { "LOSS" }
        );
        println!("{}", msg);
        info!(
            "[SIM] close {} {} pnl={:.4} roi={:.2}%",
            self.symbol,
            reason.as_str(),
            closed.pnl_usd,
            closed.roi_pct
        );
        crate::log_trading_event(&msg);

        closed
    }
}

fn gross_pnl(trade: &ActiveTrade, price: f64) -> f64 {
    match trade.side {
        PositionSide::Long => (price - trade.entry_price) * trade.quantity,
        PositionSide::Short => (trade.entry_price - price) * trade.quantity,
    }
}

fn finite_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}
