// Per-symbol market state store: candle ring, flow window, last prices

use crate::types::{AggTrade, Candle, FlowContext, MarketEvent, SymbolState, TradeSide};
use std::collections::HashMap;

/// Bounds applied by the store when mutating symbol state.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Candle ring capacity.
    pub history_candles: usize,
    /// Flow window lookback behind the newest trade.
    pub flow_lookback_ms: i64,
    /// Decision-timeframe length, used to project the next candle close.
    pub cycle_ms: i64,
}

impl SymbolState {
    /// Seed the candle ring from history hydration. Rows must already be
    /// ordered by close time; the ring is truncated to the limit.
    pub fn seed_candles(&mut self, mut candles: Vec<Candle>, limits: &StoreLimits) {
        candles.sort_by_key(|c| c.close_time);
        candles.dedup_by_key(|c| c.close_time);
        self.candles = candles.into_iter().collect();
        while self.candles.len() > limits.history_candles {
            self.candles.pop_front();
        }
        if let Some(last) = self.candles.back() {
            self.next_candle_close_ts = Some(last.close_time + limits.cycle_ms);
        }
    }

    pub fn apply_event(&mut self, event: &MarketEvent, limits: &StoreLimits) {
        match event {
            MarketEvent::Trade {
                price,
                qty,
                ts,
                side,
                ..
            } => self.apply_trade(*price, *qty, *ts, *side, limits),
            MarketEvent::Mark { price, ts, .. } => {
                self.mark_price = Some(*price);
                self.mark_ts = Some(*ts);
            }
            MarketEvent::Kline {
                candle, is_closed, ..
            } => self.apply_kline(candle, *is_closed, limits),
        }
    }

    fn apply_trade(&mut self, price: f64, qty: f64, ts: i64, side: TradeSide, limits: &StoreLimits) {
        self.trade_price = Some(price);
        self.trade_qty = Some(qty);
        self.trade_ts = Some(ts);

        if qty > 0.0 && ts > 0 {
            self.flow.push_back(AggTrade { ts, qty, side });
            let newest = self.flow.back().map(|t| t.ts).unwrap_or(ts);
            let cutoff = newest - limits.flow_lookback_ms;
            while let Some(front) = self.flow.front() {
                if front.ts < cutoff {
                    self.flow.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn apply_kline(&mut self, candle: &Candle, is_closed: bool, limits: &StoreLimits) {
        if is_closed {
            // Upsert: append if newer than the ring's last close, replace if equal.
            match self.candles.back() {
                Some(last) if candle.close_time < last.close_time => {}
                Some(last) if candle.close_time == last.close_time => {
                    *self.candles.back_mut().expect("ring non-empty") = candle.clone();
                }
                _ => self.candles.push_back(candle.clone()),
            }
            while self.candles.len() > limits.history_candles {
                self.candles.pop_front();
            }
        }

        self.last_volume_5m = Some(candle.volume);
        self.next_candle_close_ts = Some(if is_closed {
            candle.close_time + limits.cycle_ms
        } else {
            candle.close_time
        });
    }

    /// Best available live price: last trade, else mark, else last close.
    pub fn live_price(&self) -> Option<f64> {
        self.trade_price
            .or(self.mark_price)
            .or_else(|| self.candles.back().map(|c| c.close))
    }

    /// Milliseconds until the current cycle ends; `None` means unknown,
    /// which callers treat as infinitely far away.
    pub fn ms_to_next_candle(&self, now: i64, limits: &StoreLimits) -> Option<i64> {
        if let Some(next) = self.next_candle_close_ts {
            return Some((next - now).max(0));
        }
        self.candles
            .back()
            .map(|c| (c.close_time + limits.cycle_ms - now).max(0))
    }

    /// Cycle key for the decision planner.
    pub fn current_cycle_id(&self, limits: &StoreLimits) -> Option<i64> {
        self.next_candle_close_ts
            .or_else(|| self.candles.back().map(|c| c.close_time + limits.cycle_ms))
    }

    /// Aggregate the flow window into an imbalance, if any volume is present.
    pub fn flow_context(&self) -> Option<FlowContext> {
        if self.flow.is_empty() {
            return None;
        }
        let mut buy_qty = 0.0;
        let mut sell_qty = 0.0;
        for trade in &self.flow {
            match trade.side {
                TradeSide::Buy => buy_qty += trade.qty,
                TradeSide::Sell => sell_qty += trade.qty,
            }
        }
        let total = buy_qty + sell_qty;
        if total <= 0.0 {
            return None;
        }
        Some(FlowContext {
            imbalance: (buy_qty - sell_qty) / total,
            samples: self.flow.len(),
        })
    }
}

/// Owning map of all tracked symbols, keyed by lowercase market symbol.
pub struct SymbolStore {
    limits: StoreLimits,
    states: HashMap<String, SymbolState>,
    order: Vec<String>,
}

impl SymbolStore {
    pub fn new(symbols: &[String], limits: StoreLimits) -> Self {
        let mut states = HashMap::new();
        let mut order = Vec::new();
        for symbol in symbols {
            let key = symbol.to_lowercase();
            states.insert(key.clone(), SymbolState::default());
            order.push(key);
        }
        Self {
            limits,
            states,
            order,
        }
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Configured symbol ordering (drives tick-loop iteration order).
    pub fn symbols(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut SymbolState> {
        self.states.get_mut(symbol)
    }

    /// Route an event to its owning state; events for unknown symbols drop.
    pub fn apply_event(&mut self, event: &MarketEvent, now: i64) {
        let limits = self.limits;
        if let Some(state) = self.states.get_mut(event.symbol()) {
            state.last_stream_at = Some(now);
            state.apply_event(event, &limits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: StoreLimits = StoreLimits {
        history_candles: 3,
        flow_lookback_ms: 60_000,
        cycle_ms: 300_000,
    };

    fn candle(close_time: i64, close: f64) -> Candle {
        Candle {
            open_time: close_time - 300_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            close_time,
        }
    }

    fn kline(close_time: i64, close: f64, is_closed: bool) -> MarketEvent {
        MarketEvent::Kline {
            symbol: "btcusdt".into(),
            candle: candle(close_time, close),
            is_closed,
        }
    }

    #[test]
    fn candle_ring_is_bounded_and_strictly_increasing() {
        let mut state = SymbolState::default();
        for i in 0..5 {
            state.apply_event(&kline(300_000 * (i + 1), 100.0 + i as f64, true), &LIMITS);
        }
        assert_eq!(state.candles.len(), LIMITS.history_candles);
        let closes: Vec<i64> = state.candles.iter().map(|c| c.close_time).collect();
        let mut sorted = closes.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(closes, sorted);
    }

    #[test]
    fn duplicate_close_time_replaces_in_place() {
        let mut state = SymbolState::default();
        state.apply_event(&kline(300_000, 100.0, true), &LIMITS);
        state.apply_event(&kline(300_000, 101.5, true), &LIMITS);
        assert_eq!(state.candles.len(), 1);
        assert_eq!(state.candles.back().unwrap().close, 101.5);
        // replaying the identical event leaves the ring unchanged
        let snapshot: Vec<Candle> = state.candles.iter().cloned().collect();
        state.apply_event(&kline(300_000, 101.5, true), &LIMITS);
        assert_eq!(snapshot, state.candles.iter().cloned().collect::<Vec<_>>());
    }

    #[test]
    fn open_kline_updates_cycle_but_not_ring() {
        let mut state = SymbolState::default();
        state.apply_event(&kline(300_000, 100.0, true), &LIMITS);
        state.apply_event(&kline(600_000, 100.5, false), &LIMITS);
        assert_eq!(state.candles.len(), 1);
        assert_eq!(state.last_volume_5m, Some(10.0));
        // still-forming candle: cycle ends at its close time
        assert_eq!(state.next_candle_close_ts, Some(600_000));
        // closed candle: cycle rolls one interval past its close
        state.apply_event(&kline(600_000, 100.5, true), &LIMITS);
        assert_eq!(state.next_candle_close_ts, Some(900_000));
    }

    #[test]
    fn flow_window_prunes_by_lookback() {
        let mut state = SymbolState::default();
        let trade = |ts, qty, side| MarketEvent::Trade {
            symbol: "btcusdt".into(),
            price: 100.0,
            qty,
            ts,
            side,
        };
        state.apply_event(&trade(1_000, 2.0, TradeSide::Buy), &LIMITS);
        state.apply_event(&trade(30_000, 1.0, TradeSide::Sell), &LIMITS);
        state.apply_event(&trade(70_000, 1.0, TradeSide::Buy), &LIMITS);
        assert_eq!(state.flow.len(), 2); // ts=1_000 fell out of the window

        let flow = state.flow_context().unwrap();
        assert_eq!(flow.samples, 2);
        assert!((flow.imbalance - 0.0).abs() < 1e-12); // 1 buy vs 1 sell
    }

    #[test]
    fn zero_qty_trades_update_price_but_not_flow() {
        let mut state = SymbolState::default();
        state.apply_event(
            &MarketEvent::Trade {
                symbol: "btcusdt".into(),
                price: 99.5,
                qty: 0.0,
                ts: 1_000,
                side: TradeSide::Buy,
            },
            &LIMITS,
        );
        assert_eq!(state.trade_price, Some(99.5));
        assert!(state.flow.is_empty());
        assert!(state.flow_context().is_none());
    }

    #[test]
    fn live_price_prefers_trade_then_mark_then_close() {
        let mut state = SymbolState::default();
        assert_eq!(state.live_price(), None);
        state.apply_event(&kline(300_000, 100.0, true), &LIMITS);
        assert_eq!(state.live_price(), Some(100.0));
        state.apply_event(
            &MarketEvent::Mark {
                symbol: "btcusdt".into(),
                price: 100.2,
                ts: 310_000,
            },
            &LIMITS,
        );
        assert_eq!(state.live_price(), Some(100.2));
        state.apply_event(
            &MarketEvent::Trade {
                symbol: "btcusdt".into(),
                price: 100.4,
                qty: 1.0,
                ts: 311_000,
                side: TradeSide::Buy,
            },
            &LIMITS,
        );
        assert_eq!(state.live_price(), Some(100.4));
    }

    #[test]
    fn ms_to_next_candle_clamps_and_falls_back() {
        let mut state = SymbolState::default();
        assert_eq!(state.ms_to_next_candle(0, &LIMITS), None);

        state.seed_candles(vec![candle(300_000, 100.0)], &LIMITS);
        // seeded ring projects one interval past the last close
        assert_eq!(state.ms_to_next_candle(400_000, &LIMITS), Some(200_000));
        assert_eq!(state.current_cycle_id(&LIMITS), Some(600_000));
        // past the boundary the remaining time clamps at zero
        assert_eq!(state.ms_to_next_candle(700_000, &LIMITS), Some(0));

        // without a projected close, fall back to last close + one interval
        state.next_candle_close_ts = None;
        assert_eq!(state.ms_to_next_candle(400_000, &LIMITS), Some(200_000));
        assert_eq!(state.current_cycle_id(&LIMITS), Some(600_000));
    }
}
