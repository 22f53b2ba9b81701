// End-to-end pipeline: decoded frames -> store -> analyzer -> planner -> sim

use perp_trigger_trading::config::SimConfig;
use perp_trigger_trading::decoder::{decode_frame, DecodedFrame};
use perp_trigger_trading::planner::{sync_plan, PlanTransition, PlannerSettings};
use perp_trigger_trading::simulation::SimState;
use perp_trigger_trading::store::StoreLimits;
use perp_trigger_trading::strategy::{analyze, AnalyzerSettings};
use perp_trigger_trading::types::{Candle, DecisionStatus, ExitReason, MarketEvent, SymbolState};

const LIMITS: StoreLimits = StoreLimits {
    history_candles: 40,
    flow_lookback_ms: 60_000,
    cycle_ms: 300_000,
};

const ANALYZER: AnalyzerSettings = AnalyzerSettings {
    history_candles: 40,
    decision_window_ms: 300_000,
    flow_min_samples: 20,
    flow_confirm_threshold: 0.08,
};

const PLANNER: PlannerSettings = PlannerSettings {
    trigger_min_pct: 0.05,
    trigger_max_pct: 1.2,
};

fn sim_config() -> SimConfig {
    SimConfig {
        margin_usd: 10.0,
        leverage: 20.0,
        sl_roi_min_pct: 8.0,
        sl_roi_max_pct: 15.0,
        trail_activate_roi_min_pct: 10.0,
        trail_activate_roi_max_pct: 20.0,
        trail_dd_roi_min_pct: 4.0,
        trail_dd_roi_max_pct: 8.0,
        min_net_profit_usd: 0.05,
        fee_rate_pct: 0.05,
    }
}

fn trending_history(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = 100.0 + i as f64 * 0.8;
            let close_time = (i as i64 + 1) * 300_000;
            Candle {
                open_time: close_time - 300_000,
                open: close,
                high: close + 0.6,
                low: close - 0.6,
                close,
                volume: 50.0,
                close_time,
            }
        })
        .collect()
}

fn mark_frame(symbol: &str, price: f64, ts: i64) -> String {
    format!(r#"{{"stream":"{0}@markPrice@1s","data":{{"e":"markPriceUpdate","E":{ts},"s":"{1}","p":"{price}"}}}}"#,
        symbol.to_lowercase(), symbol.to_uppercase())
}

fn trade_frame(symbol: &str, price: f64, qty: f64, ts: i64, buyer_maker: bool) -> String {
    format!(r#"{{"stream":"{0}@aggTrade","data":{{"e":"aggTrade","E":{ts},"s":"{1}","p":"{price}","q":"{qty}","T":{ts},"m":{buyer_maker}}}}}"#,
        symbol.to_lowercase(), symbol.to_uppercase())
}

fn apply_frame(state: &mut SymbolState, raw: &str) -> MarketEvent {
    match decode_frame(raw).expect("frame decodes") {
        DecodedFrame::Event(event) => {
            state.apply_event(&event, &LIMITS);
            event
        }
        other => panic!("expected an event, got {other:?}"),
    }
}

#[test]
fn breakout_opens_then_stops_out() {
    let mut state = SymbolState::default();
    state.seed_candles(trending_history(40), &LIMITS);

    let last_close = 12_000_000;
    let now = last_close + 250_000; // 50s before the cycle boundary

    apply_frame(&mut state, &mark_frame("BTCUSDT", 132.0, now));

    let analysis = analyze(
        &state.candles.iter().cloned().collect::<Vec<_>>(),
        state.live_price(),
        state.ms_to_next_candle(now, &LIMITS),
        state.last_volume_5m,
        state.flow_context(),
        &ANALYZER,
    );
    assert_eq!(analysis.status, DecisionStatus::Setup);

    let mut plan = None;
    let transition = sync_plan(
        &mut plan,
        state.current_cycle_id(&LIMITS),
        &analysis,
        state.live_price(),
        now,
        &PLANNER,
    );
    assert_eq!(transition, PlanTransition::Created);
    let long_above = plan.as_ref().unwrap().long_above;
    assert!(long_above > 132.0);

    // a print through the long trigger opens the simulated trade
    let breakout_price = long_above + 0.01;
    apply_frame(
        &mut state,
        &trade_frame("BTCUSDT", breakout_price, 0.5, now + 1_000, false),
    );
    let live = state.live_price().unwrap();
    assert!(live >= long_above);

    let mut sim = SimState::new("BTCUSDT");
    let plan_ref = plan.as_mut().unwrap();
    let opened = sim
        .maybe_open_trade(plan_ref, live, now + 1_000, &sim_config())
        .cloned()
        .expect("breakout opens a trade");
    assert!(plan_ref.has_triggered);
    assert!(opened.quantity > 0.0);

    // the same cycle never re-fires, even if price keeps running
    assert!(sim
        .maybe_open_trade(plan_ref, live + 1.0, now + 2_000, &sim_config())
        .is_none());

    // a hard flush through the stop closes the trade at a loss
    apply_frame(
        &mut state,
        &trade_frame("BTCUSDT", live - 3.0, 1.0, now + 5_000, true),
    );
    let closed = sim
        .update_open_trade(state.live_price().unwrap(), now + 5_000)
        .expect("stop loss fires");
    assert_eq!(closed.exit_reason, ExitReason::SlRoi);
    assert!(!closed.is_win);
    assert!((closed.pnl_usd - (closed.gross_pnl_usd - closed.fees_usd)).abs() < 1e-9);
    assert_eq!(sim.stats.total_trades, 1);
    assert!(sim.active.is_none());
}

#[test]
fn far_from_candle_close_stays_wait_and_plans_nothing() {
    let mut state = SymbolState::default();
    state.seed_candles(trending_history(40), &LIMITS);
    let now = 12_000_000 + 250_000;
    apply_frame(&mut state, &mark_frame("ETHUSDT", 132.0, now));

    // pretend the cycle just rolled: a full interval remains
    state.next_candle_close_ts = Some(now + 300_001);
    let analysis = analyze(
        &state.candles.iter().cloned().collect::<Vec<_>>(),
        state.live_price(),
        state.ms_to_next_candle(now, &LIMITS),
        state.last_volume_5m,
        state.flow_context(),
        &ANALYZER,
    );
    assert_eq!(analysis.status, DecisionStatus::Wait);

    let mut plan = None;
    sync_plan(
        &mut plan,
        state.current_cycle_id(&LIMITS),
        &analysis,
        state.live_price(),
        now,
        &PLANNER,
    );
    assert!(plan.is_none());
}

#[test]
fn heavy_sell_flow_in_window_vetoes_the_long_entry() {
    let mut state = SymbolState::default();
    state.seed_candles(trending_history(40), &LIMITS);
    let now = 12_000_000 + 250_000;
    apply_frame(&mut state, &mark_frame("BTCUSDT", 132.0, now));

    // 25 aggressive sells dominate the rolling window
    for i in 0..25i64 {
        apply_frame(
            &mut state,
            &trade_frame("BTCUSDT", 132.0, 1.0, now - 30_000 + i * 1_000, true),
        );
    }
    let flow = state.flow_context().unwrap();
    assert_eq!(flow.samples, 25);
    assert!(flow.imbalance < -0.05);

    // conflict with the uptrend keeps the cycle SIDEWAYS, but the plan still
    // records the flow so the simulator gate sees it after a promotion
    let analysis = analyze(
        &state.candles.iter().cloned().collect::<Vec<_>>(),
        state.live_price(),
        state.ms_to_next_candle(now, &LIMITS),
        state.last_volume_5m,
        state.flow_context(),
        &ANALYZER,
    );
    assert_eq!(analysis.status, DecisionStatus::Sideways);
    assert_eq!(analysis.flow_samples, Some(25));
}
