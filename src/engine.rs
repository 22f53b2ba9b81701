// Tick loop: drain feed events, analyze, plan, simulate, mirror, render

use crate::config::AppConfig;
use crate::feed::FeedHandle;
use crate::planner::{sync_plan, PlanTransition, PlannerSettings};
use crate::render::{render_tick, Row};
use crate::simulation::SimState;
use crate::store::SymbolStore;
use crate::strategy::{analyze, AnalyzerSettings};
use crate::trading::LiveTrader;
use crate::types::{Candle, DecisionPlan, MarketEvent, PositionSide};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

const LIVE_SYNC_INTERVAL_MS: u64 = 3_000;

pub struct Engine {
    cfg: AppConfig,
    store: SymbolStore,
    /// Per display symbol, in configured order.
    sims: HashMap<String, SimState>,
    plans: HashMap<String, Option<DecisionPlan>>,
    feed: Arc<FeedHandle>,
    events_rx: mpsc::Receiver<MarketEvent>,
    live: Option<Arc<LiveTrader>>,
    analyzer_settings: AnalyzerSettings,
    planner_settings: PlannerSettings,
}

impl Engine {
    pub fn new(
        cfg: AppConfig,
        store: SymbolStore,
        feed: Arc<FeedHandle>,
        events_rx: mpsc::Receiver<MarketEvent>,
        live: Option<Arc<LiveTrader>>,
    ) -> Self {
        let mut sims = HashMap::new();
        let mut plans = HashMap::new();
        for symbol in &cfg.symbols {
            sims.insert(symbol.clone(), SimState::new(symbol.clone()));
            plans.insert(symbol.clone(), None);
        }
        let analyzer_settings = AnalyzerSettings {
            history_candles: cfg.candles.history_candles,
            decision_window_ms: cfg.candles.decision_window_ms,
            flow_min_samples: cfg.flow.flow_min_samples,
            flow_confirm_threshold: cfg.flow.flow_confirm_threshold,
        };
        let planner_settings = PlannerSettings {
            trigger_min_pct: cfg.trigger.trigger_min_pct,
            trigger_max_pct: cfg.trigger.trigger_max_pct,
        };
        Self {
            cfg,
            store,
            sims,
            plans,
            feed,
            events_rx,
            live,
            analyzer_settings,
            planner_settings,
        }
    }

    /// Run until ctrl-c. Events are applied as they arrive; the decision
    /// pipeline runs at the fixed render cadence off a monotonic interval.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut tick = interval(Duration::from_millis(
            self.cfg.stream.render_interval_ms.max(100),
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Periodic authoritative reconciliation runs beside the tick loop.
        let sync_task = self.live.clone().map(|live| {
            tokio::spawn(async move {
                let mut timer = interval(Duration::from_millis(LIVE_SYNC_INTERVAL_MS));
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    timer.tick().await;
                    live.sync_runtime().await;
                }
            })
        });

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut events_open = true;

        loop {
            tokio::select! {
                maybe_event = self.events_rx.recv(), if events_open => {
                    match maybe_event {
                        Some(event) => {
                            let now = chrono::Utc::now().timestamp_millis();
                            self.store.apply_event(&event, now);
                        }
                        None => {
                            // Feed task gone; keep ticking on cached state.
                            warn!("engine: feed channel closed");
                            events_open = false;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                _ = &mut ctrl_c => {
                    info!("engine: shutdown signal received");
                    break;
                }
            }
        }

        if let Some(task) = sync_task {
            task.abort();
        }
        self.feed.shutdown();
        // give the close frame a moment to flush before the process exits
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.print_summary();
        Ok(())
    }

    async fn on_tick(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();

        // Stale-feed watchdog: force a reconnect, keep ticking on cached state.
        let silent_for = now - self.feed.last_message_at();
        if silent_for > self.cfg.stream.ws_stale_timeout_ms {
            warn!("engine: feed silent for {silent_for}ms, forcing reconnect");
            self.feed.force_reconnect();
        }

        let mut rows = Vec::with_capacity(self.cfg.symbols.len());
        let limits = *self.store.limits();

        for symbol in self.cfg.symbols.clone() {
            let market_symbol = self.cfg.market_symbol(&symbol);
            let market_key = market_symbol.to_lowercase();

            // Snapshot the pieces the pure pipeline needs.
            let (candles, live_price, ms_to_next, cycle_id, last_volume, flow, last_error) =
                match self.store.get(&market_key) {
                    Some(state) => (
                        state.candles.iter().cloned().collect::<Vec<Candle>>(),
                        state.live_price(),
                        state.ms_to_next_candle(now, &limits),
                        state.current_cycle_id(&limits),
                        state.last_volume_5m,
                        state.flow_context(),
                        state.last_error.clone(),
                    ),
                    None => continue,
                };

            let analysis = analyze(
                &candles,
                live_price,
                ms_to_next,
                last_volume,
                flow,
                &self.analyzer_settings,
            );

            let plan_slot = self.plans.entry(symbol.clone()).or_default();
            let transition = sync_plan(
                plan_slot,
                cycle_id,
                &analysis,
                live_price,
                now,
                &self.planner_settings,
            );
            match transition {
                PlanTransition::Created => {
                    if let Some(plan) = plan_slot.as_ref() {
                        info!(
                            "plan {} cycle={} {} trigger={:.2}% ▲{:.6} ▼{:.6}",
                            symbol,
                            plan.cycle_id,
                            plan.status.as_str(),
                            plan.trigger_pct,
                            plan.long_above,
                            plan.short_below
                        );
                    }
                }
                PlanTransition::Promoted => {
                    info!("plan {} promoted to SETUP: {}", symbol, analysis.reason);
                }
                _ => {}
            }

            let sim = self.sims.get_mut(&symbol).expect("sim exists per symbol");

            if let Some(price) = live_price {
                // Update first: a close and a re-open never share a tick side.
                if sim.update_open_trade(price, now).is_some() {
                    if let Some(live) = &self.live {
                        if live.has_rule(&market_symbol).await {
                            live.close_position(&market_symbol).await;
                        }
                    }
                }

                if let Some(plan) = plan_slot.as_mut() {
                    let opened_side: Option<PositionSide> = sim
                        .maybe_open_trade(plan, price, now, &self.cfg.sim)
                        .map(|t| t.side);
                    if let (Some(side), Some(live)) = (opened_side, &self.live) {
                        if live.has_rule(&market_symbol).await {
                            live.open_position(&market_symbol, side, price).await;
                        }
                    }
                }
            }

            rows.push(
                self.build_row(
                    &symbol,
                    &market_symbol,
                    live_price,
                    ms_to_next,
                    last_volume,
                    last_error,
                )
                .await,
            );
        }

        render_tick(&rows);
    }

    async fn build_row(
        &self,
        symbol: &str,
        market_symbol: &str,
        live_price: Option<f64>,
        ms_to_next: Option<i64>,
        last_volume: Option<f64>,
        last_error: Option<String>,
    ) -> Row {
        let state = self.store.get(&market_symbol.to_lowercase());
        let sim = &self.sims[symbol];
        let plan = self.plans.get(symbol).and_then(|p| p.as_ref());

        let (sim_net, sim_roi) = live_price
            .and_then(|p| sim.open_metrics(p))
            .map(|(net, roi)| (Some(net), Some(roi)))
            .unwrap_or((None, None));

        let (live_position, live_income, live_note) = match &self.live {
            Some(live) => (
                live.position_for(market_symbol).await,
                Some(live.income_stats().await),
                live.status_note().await,
            ),
            None => (None, None, None),
        };

        let note = last_error
            .or(live_note)
            .or_else(|| plan.map(|p| p.reason.clone()));

        Row {
            symbol: symbol.to_string(),
            mark_price: state.and_then(|s| s.mark_price),
            trade_price: state.and_then(|s| s.trade_price),
            last_volume_5m: last_volume,
            ms_to_next_candle: ms_to_next,
            plan_status: plan.map(|p| p.status.as_str().to_string()),
            long_above: plan.map(|p| p.long_above),
            short_below: plan.map(|p| p.short_below),
            sim_side: sim.active.as_ref().map(|t| t.side),
            sim_net_pnl_usd: sim_net,
            sim_roi_pct: sim_roi,
            sim_trades: sim.stats.total_trades,
            sim_realized_pnl_usd: sim.stats.realized_pnl_usd,
            note,
            live_position,
            live_income,
        }
    }

    fn print_summary(&self) {
        for symbol in &self.cfg.symbols {
            let sim = &self.sims[symbol];
            let msg = format!(
                "[SIM] 📊 SUMMARY | symbol={} | trades={} | wins={} | losses={} | realized={:+.4}",
                symbol,
                sim.stats.total_trades,
                sim.stats.winning_trades,
                sim.stats.losing_trades,
                sim.stats.realized_pnl_usd
            );
            println!("{}", msg);
            crate::log_trading_event(&msg);
        }
    }
}
