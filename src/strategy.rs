// Strategy analyzer: candle history + live price + flow -> DecisionAnalysis

use crate::types::{Candle, DecisionAnalysis, DecisionStatus, FlowContext};

/// Hard clamp applied to the computed trigger displacement (percent).
pub const TRIGGER_FLOOR_PCT: f64 = 0.08;
pub const TRIGGER_CEIL_PCT: f64 = 2.2;

const ATR_LOOKBACK: usize = 14;
const EMA_FAST_WINDOW: usize = 30;
const EMA_FAST_PERIOD: usize = 9;
const EMA_SLOW_WINDOW: usize = 40;
const EMA_SLOW_PERIOD: usize = 21;
const VOLUME_LOOKBACK: usize = 20;
const WEAK_TREND_PCT: f64 = 0.08;
const WEAK_VOLUME_RATIO: f64 = 0.75;

/// Analyzer inputs that come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSettings {
    pub history_candles: usize,
    pub decision_window_ms: i64,
    pub flow_min_samples: usize,
    pub flow_confirm_threshold: f64,
}

/// Pure decision analysis for one symbol. No state is read or written here;
/// the planner decides what to do with the result.
pub fn analyze(
    candles: &[Candle],
    live_price: Option<f64>,
    ms_to_next_candle: Option<i64>,
    last_volume: Option<f64>,
    flow: Option<FlowContext>,
    settings: &AnalyzerSettings,
) -> DecisionAnalysis {
    let price = match live_price {
        Some(p) if p.is_finite() && p > 0.0 => p,
        _ => return DecisionAnalysis::wait("no live price"),
    };
    if candles.len() < settings.history_candles {
        return DecisionAnalysis::wait(format!(
            "warming up {}/{} candles",
            candles.len(),
            settings.history_candles
        ));
    }
    match ms_to_next_candle {
        Some(ms) if ms <= settings.decision_window_ms => {}
        _ => return DecisionAnalysis::wait("outside decision window"),
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();

    let atr_pct = mean(
        &candles
            .iter()
            .rev()
            .take(ATR_LOOKBACK)
            .filter(|c| c.close != 0.0)
            .map(|c| (c.high - c.low).abs() / c.close * 100.0)
            .collect::<Vec<_>>(),
    );
    let vol_pct = std_dev(&returns) * 100.0;

    let fast = ema(tail(&closes, EMA_FAST_WINDOW), EMA_FAST_PERIOD);
    let slow = ema(tail(&closes, EMA_SLOW_WINDOW), EMA_SLOW_PERIOD);
    let trend_pct = match (fast, slow) {
        (Some(f), Some(s)) if s != 0.0 => (f - s) / s * 100.0,
        _ => 0.0,
    };

    let volumes: Vec<f64> = candles
        .iter()
        .rev()
        .take(VOLUME_LOOKBACK)
        .map(|c| c.volume)
        .collect();
    let avg_volume = mean(&volumes);
    let current_volume = last_volume
        .filter(|v| v.is_finite())
        .or_else(|| candles.last().map(|c| c.volume))
        .unwrap_or(0.0);
    let volume_ratio = if avg_volume > 0.0 {
        current_volume / avg_volume
    } else {
        0.0
    };

    // Flow is only trusted once enough samples accumulated in the window.
    let flow = flow.filter(|f| f.samples >= settings.flow_min_samples && f.imbalance.is_finite());
    let flow_conflicts = flow.is_some_and(|f| {
        f.imbalance.abs() >= settings.flow_confirm_threshold && f.imbalance * trend_pct < 0.0
    });
    let flow_supports = flow.is_some_and(|f| {
        f.imbalance.abs() >= settings.flow_confirm_threshold && f.imbalance * trend_pct > 0.0
    });

    let trigger_base = atr_pct * 0.6 + vol_pct * 0.8;
    let multiplier = if flow_conflicts {
        1.25
    } else if flow_supports {
        0.85
    } else {
        1.0
    };
    let trigger_pct = (trigger_base * multiplier).clamp(TRIGGER_FLOOR_PCT, TRIGGER_CEIL_PCT);

    let long_above = price * (1.0 + trigger_pct / 100.0);
    let short_below = price * (1.0 - trigger_pct / 100.0);

    let weak_trend = trend_pct.abs() < WEAK_TREND_PCT;
    let weak_volume = volume_ratio < WEAK_VOLUME_RATIO;

    let (status, reason) = if weak_trend && weak_volume {
        (
            DecisionStatus::Sideways,
            format!(
                "flat: trend {:.3}% vol ratio {:.2}",
                trend_pct, volume_ratio
            ),
        )
    } else if flow_conflicts {
        (
            DecisionStatus::Sideways,
            format!(
                "flow {:.3} against trend {:.3}%",
                flow.map(|f| f.imbalance).unwrap_or(0.0),
                trend_pct
            ),
        )
    } else {
        let bias = if trend_pct >= 0.0 { "long" } else { "short" };
        (
            DecisionStatus::Setup,
            format!("{bias} bias: trend {:.3}% trigger {:.2}%", trend_pct, trigger_pct),
        )
    };

    DecisionAnalysis {
        status,
        reason,
        long_above: Some(long_above),
        short_below: Some(short_below),
        trigger_pct,
        flow_imbalance: flow.map(|f| f.imbalance),
        flow_samples: flow.map(|f| f.samples),
    }
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// EMA seeded with the first value; each later step uses α = 2/(period+1).
fn ema(values: &[f64], period: usize) -> Option<f64> {
    let mut iter = values.iter();
    let mut value = *iter.next()?;
    let alpha = 2.0 / (period as f64 + 1.0);
    for v in iter {
        value = v * alpha + value * (1.0 - alpha);
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: AnalyzerSettings = AnalyzerSettings {
        history_candles: 40,
        decision_window_ms: 300_000,
        flow_min_samples: 20,
        flow_confirm_threshold: 0.08,
    };

    fn candle(i: usize, close: f64, range: f64, volume: f64) -> Candle {
        let close_time = (i as i64 + 1) * 300_000;
        Candle {
            open_time: close_time - 300_000,
            open: close,
            high: close + range / 2.0,
            low: close - range / 2.0,
            close,
            volume,
            close_time,
        }
    }

    /// Steadily rising closes with healthy volume -> SETUP with long bias.
    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i, 100.0 + i as f64 * 0.8, 1.2, 50.0))
            .collect()
    }

    fn flat_candles(n: usize) -> Vec<Candle> {
        // tiny range keeps the raw trigger below the floor clamp
        (0..n).map(|i| candle(i, 100.0, 0.05, 50.0)).collect()
    }

    #[test]
    fn waits_without_live_price() {
        let a = analyze(&trending_candles(40), None, Some(1_000), None, None, &SETTINGS);
        assert_eq!(a.status, DecisionStatus::Wait);
    }

    #[test]
    fn waits_while_warming_up() {
        let a = analyze(
            &trending_candles(10),
            Some(100.0),
            Some(1_000),
            None,
            None,
            &SETTINGS,
        );
        assert_eq!(a.status, DecisionStatus::Wait);
        assert!(a.reason.contains("10/40"));
    }

    #[test]
    fn waits_outside_decision_window() {
        let a = analyze(
            &trending_candles(40),
            Some(130.0),
            Some(SETTINGS.decision_window_ms + 1),
            None,
            None,
            &SETTINGS,
        );
        assert_eq!(a.status, DecisionStatus::Wait);
        let a = analyze(&trending_candles(40), Some(130.0), None, None, None, &SETTINGS);
        assert_eq!(a.status, DecisionStatus::Wait);
    }

    #[test]
    fn trending_market_produces_setup_with_bracketing_triggers() {
        let price = 132.0;
        let a = analyze(
            &trending_candles(40),
            Some(price),
            Some(1_000),
            Some(60.0),
            None,
            &SETTINGS,
        );
        assert_eq!(a.status, DecisionStatus::Setup);
        assert!(a.trigger_pct >= TRIGGER_FLOOR_PCT && a.trigger_pct <= TRIGGER_CEIL_PCT);
        let long_above = a.long_above.unwrap();
        let short_below = a.short_below.unwrap();
        assert!(long_above > price && short_below < price);
        assert!((long_above - price * (1.0 + a.trigger_pct / 100.0)).abs() < 1e-9);
        assert!((short_below - price * (1.0 - a.trigger_pct / 100.0)).abs() < 1e-9);
    }

    #[test]
    fn flat_market_is_sideways_and_trigger_floors() {
        // zero returns and weak volume: trigger collapses onto the floor
        let a = analyze(
            &flat_candles(40),
            Some(100.0),
            Some(1_000),
            Some(10.0),
            None,
            &SETTINGS,
        );
        assert_eq!(a.status, DecisionStatus::Sideways);
        assert_eq!(a.trigger_pct, TRIGGER_FLOOR_PCT);
    }

    #[test]
    fn conflicting_flow_forces_sideways_and_widens_trigger() {
        let flow_against = FlowContext {
            imbalance: -0.2,
            samples: 25,
        };
        let with_flow = analyze(
            &trending_candles(40),
            Some(132.0),
            Some(1_000),
            Some(60.0),
            Some(flow_against),
            &SETTINGS,
        );
        let without_flow = analyze(
            &trending_candles(40),
            Some(132.0),
            Some(1_000),
            Some(60.0),
            None,
            &SETTINGS,
        );
        assert_eq!(with_flow.status, DecisionStatus::Sideways);
        assert_eq!(without_flow.status, DecisionStatus::Setup);
        assert!(with_flow.trigger_pct >= without_flow.trigger_pct);
        assert_eq!(with_flow.flow_imbalance, Some(-0.2));
        assert_eq!(with_flow.flow_samples, Some(25));
    }

    #[test]
    fn sparse_flow_is_ignored() {
        let thin_flow = FlowContext {
            imbalance: -0.9,
            samples: 5,
        };
        let a = analyze(
            &trending_candles(40),
            Some(132.0),
            Some(1_000),
            Some(60.0),
            Some(thin_flow),
            &SETTINGS,
        );
        assert_eq!(a.status, DecisionStatus::Setup);
        assert_eq!(a.flow_imbalance, None);
    }

    #[test]
    fn ema_seeds_with_first_value() {
        assert_eq!(ema(&[42.0], 9), Some(42.0));
        let alpha: f64 = 2.0 / 10.0;
        let expected = 50.0 * alpha + 42.0 * (1.0 - alpha);
        assert!((ema(&[42.0, 50.0], 9).unwrap() - expected).abs() < 1e-12);
    }
}
