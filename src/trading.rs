// Live trading adapter: mirrors simulator decisions onto the exchange

use crate::api::{FuturesApi, VenueError};
use crate::config::{EntryMode, LiveConfig};
use crate::models::{OrderResponse, PositionRiskEntry};
use crate::types::PositionSide;
use anyhow::{Context, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Hard ceiling on negotiated leverage, independent of the bracket cap.
const LEVERAGE_HARD_CAP: u32 = 20;
const LEVERAGE_FALLBACKS: [u32; 9] = [20, 15, 12, 10, 8, 5, 3, 2, 1];

const ERR_INVALID_LEVERAGE: i64 = -4028;
const ERR_MARGIN_NO_CHANGE: i64 = -4046;
/// Post-only orders rejected as immediate-match.
const GTX_REJECT_CODES: [i64; 2] = [-5022, -2010];

const INCOME_FETCH_LIMIT: usize = 1000;
const INCOME_BOOTSTRAP_LOOKBACK_MS: i64 = 24 * 3_600 * 1_000;

const ORDER_TERMINAL_STATUSES: [&str; 4] = ["FILLED", "CANCELED", "EXPIRED", "REJECTED"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Isolated,
    Cross,
    Unknown,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "ISOLATED",
            MarginMode::Cross => "CROSS",
            MarginMode::Unknown => "UNKNOWN",
        }
    }
}

/// Venue constraints and negotiated settings for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolRule {
    pub market_symbol: String,
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub bracket_max_leverage: Option<u32>,
    pub effective_leverage: u32,
    pub margin_mode: MarginMode,
}

/// Server-side position snapshot, rebuilt wholesale on each reconciliation.
#[derive(Debug, Clone)]
pub struct LivePosition {
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl_usd: f64,
    pub notional_usd: f64,
    pub margin_usd: f64,
    pub margin_type: String,
    pub leverage: f64,
}

/// Monotonic accumulators over the venue income ledger.
#[derive(Debug, Default, Clone)]
pub struct IncomeStats {
    pub realized_pnl_usd: f64,
    pub commission_usd: f64,
    pub funding_usd: f64,
    pub net_usd: f64,
    pub events: u64,
}

#[derive(Debug, Clone, Copy)]
struct TrackedPosition {
    side: PositionSide,
    quantity: f64,
}

#[derive(Default)]
struct LiveState {
    hedge_mode: bool,
    rules: HashMap<String, SymbolRule>,
    /// Locally tracked open positions; reconciliation is authoritative.
    active_positions: HashMap<String, TrackedPosition>,
    position_snapshot: HashMap<String, LivePosition>,
    income: IncomeStats,
    income_seen: HashSet<String>,
    income_cursor_ts: i64,
    last_action: Option<String>,
    last_error: Option<String>,
}

/// Mirrors simulator open/close events onto the exchange and reconciles
/// authoritative state back from it.
pub struct LiveTrader {
    api: Arc<FuturesApi>,
    cfg: LiveConfig,
    margin_usd: f64,
    target_leverage: u32,
    state: Mutex<LiveState>,
    /// One in-flight open/close per symbol.
    in_flight: Mutex<HashSet<String>>,
}

impl LiveTrader {
    pub fn new(api: Arc<FuturesApi>, cfg: LiveConfig, margin_usd: f64, target_leverage: u32) -> Self {
        Self {
            api,
            cfg,
            margin_usd,
            target_leverage: target_leverage.min(LEVERAGE_HARD_CAP).max(1),
            state: Mutex::new(LiveState::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    // -- bootstrap ----------------------------------------------------------

    /// Discover venue constraints and enforce account settings for the
    /// configured market symbols, then take the initial reconciliation.
    pub async fn bootstrap(&self, market_symbols: &[String]) -> Result<()> {
        let hedge_mode = self
            .api
            .position_mode()
            .await
            .context("position mode query failed")?;

        let info = self
            .api
            .exchange_info()
            .await
            .context("exchange info load failed")?;

        let mut rules = HashMap::new();
        for symbol in market_symbols {
            let upper = symbol.to_uppercase();
            let Some(entry) = info.symbols.iter().find(|s| s.symbol == upper) else {
                warn!("[LIVE] {upper} missing from exchange info, live mirroring disabled for it");
                continue;
            };

            let mut min_qty = Decimal::ZERO;
            let mut step_size = Decimal::ZERO;
            let mut tick_size = Decimal::ZERO;
            for filter in &entry.filters {
                match filter.filter_type.as_str() {
                    "LOT_SIZE" => {
                        min_qty = decimal_field(&filter.data, "minQty").unwrap_or(Decimal::ZERO);
                        step_size = decimal_field(&filter.data, "stepSize").unwrap_or(Decimal::ZERO);
                    }
                    "PRICE_FILTER" => {
                        tick_size = decimal_field(&filter.data, "tickSize").unwrap_or(Decimal::ZERO);
                    }
                    _ => {}
                }
            }
            if step_size.is_zero() || tick_size.is_zero() {
                warn!("[LIVE] {upper} has no usable LOT_SIZE/PRICE_FILTER, skipping");
                continue;
            }

            // Leverage brackets are best-effort; absence just removes the cap.
            let bracket_max_leverage = match self.api.leverage_brackets(&upper).await {
                Ok(brackets) => brackets
                    .iter()
                    .find(|b| b.symbol == upper)
                    .and_then(|b| b.brackets.iter().map(|x| x.initial_leverage).max()),
                Err(err) => {
                    warn!("[LIVE] {upper} leverage bracket query failed: {err}");
                    None
                }
            };

            let margin_mode = self.enforce_margin_mode(&upper).await;
            let effective_leverage = self
                .negotiate_leverage(&upper, bracket_max_leverage)
                .await;

            let msg = format!(
                "[LIVE] 🧭 BOOTSTRAP | symbol={} | step={} | min_qty={} | tick={} | bracket_max={:?} | lev={}x | margin={}",
                upper, step_size, min_qty, tick_size, bracket_max_leverage, effective_leverage,
                margin_mode.as_str()
            );
            println!("{}", msg);
            crate::log_trading_event(&msg);

            rules.insert(
                upper.clone(),
                SymbolRule {
                    market_symbol: upper,
                    min_qty,
                    step_size: step_size.normalize(),
                    tick_size: tick_size.normalize(),
                    bracket_max_leverage,
                    effective_leverage,
                    margin_mode,
                },
            );
        }

        {
            let mut state = self.state.lock().await;
            state.hedge_mode = hedge_mode;
            state.rules = rules;
            state.income_cursor_ts =
                chrono::Utc::now().timestamp_millis() - INCOME_BOOTSTRAP_LOOKBACK_MS;
        }

        self.sync_runtime().await;
        info!("[LIVE] bootstrap complete (hedge_mode={hedge_mode})");
        Ok(())
    }

    async fn enforce_margin_mode(&self, symbol: &str) -> MarginMode {
        if !self.cfg.force_isolated {
            return MarginMode::Unknown;
        }
        match self.api.set_margin_type(symbol, true).await {
            Ok(()) => MarginMode::Isolated,
            Err(err) if margin_change_is_noop(&err) => MarginMode::Isolated,
            Err(err) => {
                warn!("[LIVE] {symbol} margin mode switch failed: {err}");
                MarginMode::Unknown
            }
        }
    }

    /// Walk the candidate ladder until the venue accepts one. `-4028` means
    /// the candidate is invalid for this symbol, anything else aborts the
    /// walk; the final fallback is 1x.
    async fn negotiate_leverage(&self, symbol: &str, bracket_max: Option<u32>) -> u32 {
        for candidate in leverage_candidates(self.target_leverage, bracket_max) {
            match self.api.set_leverage(symbol, candidate).await {
                Ok(()) => return candidate,
                Err(err) if err.code == Some(ERR_INVALID_LEVERAGE) => {
                    info!("[LIVE] {symbol} leverage {candidate}x rejected, trying next");
                }
                Err(err) => {
                    warn!("[LIVE] {symbol} leverage negotiation aborted: {err}");
                    break;
                }
            }
        }
        1
    }

    // -- open / close -------------------------------------------------------

    /// Mirror a simulator open. Returns the executed quantity on success.
    pub async fn open_position(
        &self,
        market_symbol: &str,
        side: PositionSide,
        reference_price: f64,
    ) -> Option<f64> {
        let symbol = market_symbol.to_uppercase();
        if !self.try_begin(&symbol).await {
            return None;
        }
        let result = self.open_inner(&symbol, side, reference_price).await;
        self.finish(&symbol).await;
        result
    }

    async fn open_inner(
        &self,
        symbol: &str,
        side: PositionSide,
        reference_price: f64,
    ) -> Option<f64> {
        let (rule, hedge_mode) = {
            let state = self.state.lock().await;
            if state.active_positions.contains_key(symbol) {
                return None;
            }
            (state.rules.get(symbol)?.clone(), state.hedge_mode)
        };

        if !reference_price.is_finite() || reference_price <= 0.0 {
            return None;
        }
        let raw_qty = self.margin_usd * rule.effective_leverage as f64 / reference_price;
        let quantity = match normalize_quantity(&rule, raw_qty) {
            Some(q) => q,
            None => {
                self.record_failure(
                    symbol,
                    format!("qty {raw_qty:.8} below min lot {}", rule.min_qty),
                )
                .await;
                return None;
            }
        };

        let outcome = match self.cfg.entry_mode {
            EntryMode::Market => {
                self.place_market(symbol, side, quantity, hedge_mode, false)
                    .await
            }
            EntryMode::LimitGtx => {
                self.place_gtx(symbol, side, quantity, hedge_mode, &rule)
                    .await
            }
        };

        match outcome {
            Ok(executed) if executed > 0.0 => {
                let mut state = self.state.lock().await;
                state.active_positions.insert(
                    symbol.to_string(),
                    TrackedPosition {
                        side,
                        quantity: executed,
                    },
                );
                state.last_action = Some(format!(
                    "opened {} {} qty {:.6}",
                    side.as_str(),
                    symbol,
                    executed
                ));
                state.last_error = None;
                drop(state);

                let msg = format!(
                    "[LIVE] ✅ OPEN | symbol={} | side={} | qty={:.6} | mode={}",
                    symbol,
                    side.as_str(),
                    executed,
                    self.cfg.entry_mode.as_str()
                );
                println!("{}", msg);
                crate::log_trading_event(&msg);
                Some(executed)
            }
            Ok(_) => {
                self.record_failure(symbol, "entry left no filled quantity".to_string())
                    .await;
                None
            }
            Err(err) => {
                self.record_failure(symbol, format!("entry failed: {err}")).await;
                None
            }
        }
    }

    /// Mirror a simulator close with a reduce-only market order.
    pub async fn close_position(&self, market_symbol: &str) -> Option<f64> {
        let symbol = market_symbol.to_uppercase();
        if !self.try_begin(&symbol).await {
            return None;
        }
        let result = self.close_inner(&symbol).await;
        self.finish(&symbol).await;
        result
    }

    async fn close_inner(&self, symbol: &str) -> Option<f64> {
        let (rule, tracked, hedge_mode) = {
            let state = self.state.lock().await;
            let rule = state.rules.get(symbol)?.clone();
            let tracked = *state.active_positions.get(symbol)?;
            (rule, tracked, state.hedge_mode)
        };

        let quantity = match normalize_quantity(&rule, tracked.quantity) {
            Some(q) => q,
            None => {
                self.record_failure(symbol, "close qty below min lot".to_string())
                    .await;
                return None;
            }
        };
        let close_side = match tracked.side {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        };

        // In hedge mode the positionSide identifies what we are reducing; in
        // one-way mode reduceOnly protects against flips.
        let mut params = order_params(symbol, close_side, "MARKET", &quantity);
        if hedge_mode {
            params.push(("positionSide".into(), tracked.side.as_str().into()));
        } else {
            params.push(("reduceOnly".into(), "true".into()));
        }

        match self.api.place_order(params).await {
            Ok(order) => {
                let executed = parse_qty(&order).unwrap_or(0.0);
                {
                    let mut state = self.state.lock().await;
                    state.active_positions.remove(symbol);
                    state.last_action = Some(format!("closed {} qty {:.6}", symbol, executed));
                    state.last_error = None;
                }
                let msg = format!(
                    "[LIVE] ✅ CLOSE | symbol={} | side={} | qty={:.6}",
                    symbol,
                    tracked.side.as_str(),
                    executed
                );
                println!("{}", msg);
                crate::log_trading_event(&msg);
                self.sync_runtime().await;
                Some(executed)
            }
            Err(err) => {
                self.record_failure(symbol, format!("close failed: {err}")).await;
                None
            }
        }
    }

    // -- order plumbing -----------------------------------------------------

    async fn place_market(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        hedge_mode: bool,
        reduce_only: bool,
    ) -> Result<f64, VenueError> {
        let mut params = order_params(symbol, side, "MARKET", &quantity);
        if hedge_mode {
            params.push(("positionSide".into(), side.as_str().into()));
        } else if reduce_only {
            params.push(("reduceOnly".into(), "true".into()));
        }
        let order = self.api.place_order(params).await?;
        Ok(parse_qty(&order).unwrap_or(0.0))
    }

    /// Post-only entry: price at top-of-book on the passive side, poll until
    /// terminal or timeout, cancel any remainder, optionally market the rest.
    async fn place_gtx(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        hedge_mode: bool,
        rule: &SymbolRule,
    ) -> Result<f64, VenueError> {
        let book = self.api.book_ticker(symbol).await?;
        let bid: f64 = book.bid_price.parse().unwrap_or(f64::NAN);
        let ask: f64 = book.ask_price.parse().unwrap_or(f64::NAN);
        let spread = spread_bps(bid, ask).ok_or_else(|| VenueError {
            code: None,
            http_status: None,
            message: format!("unusable book ticker for {symbol}"),
        })?;
        let cap = self.cfg.spread_cap_bps(symbol);
        if spread > cap {
            return Err(VenueError {
                code: None,
                http_status: None,
                message: format!("spread {spread:.2}bps above cap {cap:.2}bps"),
            });
        }

        let raw_price = match side {
            PositionSide::Long => bid,
            PositionSide::Short => ask,
        };
        let price = normalize_price(rule, raw_price, side);

        let mut params = order_params(symbol, side, "LIMIT", &quantity);
        params.push(("price".into(), price.to_string()));
        params.push(("timeInForce".into(), "GTX".into()));
        if hedge_mode {
            params.push(("positionSide".into(), side.as_str().into()));
        }

        let order = match self.api.place_order(params).await {
            Ok(order) => order,
            Err(err) if err.code.is_some_and(|c| GTX_REJECT_CODES.contains(&c)) => {
                // Would have matched immediately: take the full size at market.
                info!("[LIVE] {symbol} GTX rejected as immediate match, falling back to MARKET");
                return self
                    .place_market(symbol, side, quantity, hedge_mode, false)
                    .await;
            }
            Err(err) => return Err(err),
        };

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.cfg.gtx_timeout_ms);
        let mut last = order;
        while !ORDER_TERMINAL_STATUSES.contains(&last.status.as_str()) {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(self.cfg.gtx_poll_ms)).await;
            match self.api.query_order(symbol, last.order_id).await {
                Ok(order) => last = order,
                Err(err) => {
                    warn!("[LIVE] {symbol} GTX poll failed: {err}");
                    break;
                }
            }
        }

        if !ORDER_TERMINAL_STATUSES.contains(&last.status.as_str()) {
            match self.api.cancel_order(symbol, last.order_id).await {
                Ok(order) => last = order,
                Err(err) => warn!("[LIVE] {symbol} GTX cancel failed: {err}"),
            }
        }

        let executed = parse_qty(&last).unwrap_or(0.0);
        let requested = quantity.to_f64().unwrap_or(0.0);
        let remainder = (requested - executed).max(0.0);

        if remainder > 0.0 && self.cfg.gtx_fallback_market {
            if let Some(rest) = normalize_quantity(rule, remainder) {
                let marketed = self
                    .place_market(symbol, side, rest, hedge_mode, false)
                    .await?;
                return Ok(executed + marketed);
            }
        }
        Ok(executed)
    }

    // -- reconciliation -----------------------------------------------------

    /// Periodic runtime sync: authoritative positions + incremental income.
    pub async fn sync_runtime(&self) {
        if let Err(err) = self.reconcile_positions().await {
            let mut state = self.state.lock().await;
            state.last_error = Some(format!("position reconcile failed: {err}"));
        }
        if let Err(err) = self.refresh_income().await {
            let mut state = self.state.lock().await;
            state.last_error = Some(format!("income refresh failed: {err}"));
        }
    }

    async fn reconcile_positions(&self) -> Result<(), VenueError> {
        let entries = self.api.position_risk().await?;
        let mut state = self.state.lock().await;

        let mut snapshot = HashMap::new();
        let mut active = HashMap::new();
        for entry in entries {
            if !state.rules.contains_key(&entry.symbol) {
                continue;
            }
            if let Some((position, tracked)) = reconcile_entry(&entry, state.hedge_mode) {
                snapshot.insert(entry.symbol.clone(), position);
                active.insert(entry.symbol.clone(), tracked);
            }
        }
        state.position_snapshot = snapshot;
        state.active_positions = active;
        Ok(())
    }

    async fn refresh_income(&self) -> Result<(), VenueError> {
        let cursor = self.state.lock().await.income_cursor_ts;
        let records = self.api.income_since(cursor, INCOME_FETCH_LIMIT).await?;
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let LiveState {
            income,
            income_seen,
            income_cursor_ts,
            ..
        } = &mut *state;
        apply_income_records(income, income_seen, income_cursor_ts, &records);
        Ok(())
    }

    // -- surface for the renderer ------------------------------------------

    pub async fn position_for(&self, market_symbol: &str) -> Option<LivePosition> {
        self.state
            .lock()
            .await
            .position_snapshot
            .get(&market_symbol.to_uppercase())
            .cloned()
    }

    pub async fn income_stats(&self) -> IncomeStats {
        self.state.lock().await.income.clone()
    }

    pub async fn status_note(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.last_error.clone().or_else(|| state.last_action.clone())
    }

    pub async fn has_rule(&self, market_symbol: &str) -> bool {
        self.state
            .lock()
            .await
            .rules
            .contains_key(&market_symbol.to_uppercase())
    }

    // -- guards -------------------------------------------------------------

    async fn try_begin(&self, symbol: &str) -> bool {
        self.in_flight.lock().await.insert(symbol.to_string())
    }

    async fn finish(&self, symbol: &str) {
        self.in_flight.lock().await.remove(symbol);
    }

    async fn record_failure(&self, symbol: &str, message: String) {
        let mut state = self.state.lock().await;
        state.last_error = Some(format!("{symbol}: {message}"));
        state.last_action = Some(format!("{symbol} order failed"));
        drop(state);
        let msg = format!("[LIVE] ❌ ORDER FAILED | symbol={} | {}", symbol, message);
        println!("{}", msg);
        warn!("{}", msg);
        crate::log_trading_event(&msg);
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn margin_change_is_noop(err: &VenueError) -> bool {
    err.code == Some(ERR_MARGIN_NO_CHANGE)
        || err.message.contains("No need to change margin type")
}

/// Candidate ladder: target first, then the fixed fallbacks, keeping only
/// candidates within the bracket max and the hard ceiling, deduplicated.
fn leverage_candidates(target: u32, bracket_max: Option<u32>) -> Vec<u32> {
    let cap = bracket_max.unwrap_or(LEVERAGE_HARD_CAP).min(LEVERAGE_HARD_CAP);
    let mut out = Vec::new();
    for candidate in std::iter::once(target).chain(LEVERAGE_FALLBACKS) {
        if candidate >= 1 && candidate <= cap && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Floor the raw quantity onto the lot grid; reject below the minimum lot.
fn normalize_quantity(rule: &SymbolRule, raw: f64) -> Option<Decimal> {
    if !raw.is_finite() || raw <= 0.0 || rule.step_size <= Decimal::ZERO {
        return None;
    }
    let raw = Decimal::from_f64(raw)?;
    let steps = (raw / rule.step_size).floor();
    let normalized = (steps * rule.step_size).round_dp(rule.step_size.scale());
    if normalized < rule.min_qty || normalized <= Decimal::ZERO {
        return None;
    }
    Some(normalized.normalize())
}

/// Round a limit price onto the tick grid, down for longs and up for shorts
/// so the order rests on the passive side.
fn normalize_price(rule: &SymbolRule, raw: f64, side: PositionSide) -> Decimal {
    let Some(raw) = Decimal::from_f64(raw) else {
        return Decimal::ZERO;
    };
    if rule.tick_size <= Decimal::ZERO {
        return raw;
    }
    let ticks = raw / rule.tick_size;
    let ticks = match side {
        PositionSide::Long => ticks.floor(),
        PositionSide::Short => ticks.ceil(),
    };
    (ticks * rule.tick_size).round_dp(rule.tick_size.scale())
}

/// Observed top-of-book spread in basis points.
fn spread_bps(bid: f64, ask: f64) -> Option<f64> {
    if !bid.is_finite() || !ask.is_finite() || bid <= 0.0 || ask <= 0.0 || ask < bid {
        return None;
    }
    let mid = (bid + ask) / 2.0;
    Some((ask - bid) / mid * 10_000.0)
}

fn order_params(
    symbol: &str,
    side: PositionSide,
    order_type: &str,
    quantity: &Decimal,
) -> Vec<(String, String)> {
    vec![
        ("symbol".into(), symbol.to_string()),
        (
            "side".into(),
            match side {
                PositionSide::Long => "BUY".into(),
                PositionSide::Short => "SELL".into(),
            },
        ),
        ("type".into(), order_type.to_string()),
        ("quantity".into(), quantity.to_string()),
    ]
}

fn parse_qty(order: &OrderResponse) -> Option<f64> {
    order.executed_qty.parse::<f64>().ok().filter(|q| q.is_finite())
}

/// Interpret one position-risk row. Side comes from the signed amount in
/// one-way mode and from `positionSide` in hedge mode; flat rows drop.
fn reconcile_entry(
    entry: &PositionRiskEntry,
    hedge_mode: bool,
) -> Option<(LivePosition, TrackedPosition)> {
    let amount: f64 = entry.position_amt.parse().ok()?;
    if amount == 0.0 || !amount.is_finite() {
        return None;
    }
    let side = if hedge_mode {
        match entry.position_side.as_deref() {
            Some("LONG") => PositionSide::Long,
            Some("SHORT") => PositionSide::Short,
            _ => return None,
        }
    } else if amount > 0.0 {
        PositionSide::Long
    } else {
        PositionSide::Short
    };

    let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<f64>().ok());
    let entry_price: f64 = entry.entry_price.parse().unwrap_or(0.0);
    let mark_price: f64 = entry.mark_price.parse().unwrap_or(0.0);
    let quantity = amount.abs();
    let notional = parse(&entry.notional)
        .map(f64::abs)
        .unwrap_or(quantity * mark_price);
    let leverage = parse(&entry.leverage).unwrap_or(0.0);

    let position = LivePosition {
        side,
        quantity,
        entry_price,
        mark_price,
        unrealized_pnl_usd: entry.unrealized_profit.parse().unwrap_or(0.0),
        notional_usd: notional,
        margin_usd: parse(&entry.isolated_margin).unwrap_or(0.0),
        margin_type: entry
            .margin_type
            .clone()
            .unwrap_or_else(|| "unknown".into()),
        leverage,
    };
    Some((position, TrackedPosition { side, quantity }))
}

fn income_key(record: &crate::models::IncomeRecord) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        record.tran_id,
        record.symbol.as_deref().unwrap_or(""),
        record.income_type,
        record.time,
        record.income
    )
}

/// Fold ledger rows into the accumulators, skipping rows already seen, and
/// advance the cursor past the newest row.
fn apply_income_records(
    income: &mut IncomeStats,
    seen: &mut HashSet<String>,
    cursor_ts: &mut i64,
    records: &[crate::models::IncomeRecord],
) {
    for record in records {
        if !seen.insert(income_key(record)) {
            continue;
        }
        let amount: f64 = match record.income.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        match record.income_type.as_str() {
            "REALIZED_PNL" => income.realized_pnl_usd += amount,
            "COMMISSION" => income.commission_usd += amount,
            "FUNDING_FEE" => income.funding_usd += amount,
            _ => {}
        }
        income.net_usd += amount;
        income.events += 1;
        if record.time >= *cursor_ts {
            *cursor_ts = record.time + 1;
        }
    }
}

fn decimal_field(data: &HashMap<String, serde_json::Value>, key: &str) -> Option<Decimal> {
    data.get(key)?
        .as_str()
        .and_then(|s| s.parse::<Decimal>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IncomeRecord;
    use rust_decimal_macros::dec;

    fn rule(step: Decimal, min_qty: Decimal, tick: Decimal) -> SymbolRule {
        SymbolRule {
            market_symbol: "BTCUSDT".into(),
            min_qty,
            step_size: step,
            tick_size: tick,
            bracket_max_leverage: Some(20),
            effective_leverage: 20,
            margin_mode: MarginMode::Isolated,
        }
    }

    #[test]
    fn quantity_floors_onto_the_step_grid() {
        let r = rule(dec!(0.001), dec!(0.001), dec!(0.1));
        let q = normalize_quantity(&r, 1.99004975).unwrap();
        assert_eq!(q, dec!(1.99));
        // on-grid amounts survive unchanged
        assert_eq!(normalize_quantity(&r, 0.005).unwrap(), dec!(0.005));
        // below min lot rejects
        assert!(normalize_quantity(&r, 0.0004).is_none());
        assert!(normalize_quantity(&r, -1.0).is_none());
        assert!(normalize_quantity(&r, f64::NAN).is_none());
    }

    #[test]
    fn normalized_quantity_is_a_step_multiple() {
        let r = rule(dec!(0.001), dec!(0.001), dec!(0.1));
        for raw in [0.0013, 0.12345, 7.77777, 42.0001] {
            let q = normalize_quantity(&r, raw).unwrap();
            assert!((q / r.step_size).fract().is_zero(), "{raw} -> {q}");
            assert!(q >= r.min_qty);
        }
    }

    #[test]
    fn limit_price_rounds_toward_the_passive_side() {
        let r = rule(dec!(0.001), dec!(0.001), dec!(0.10));
        assert_eq!(
            normalize_price(&r, 100.46, PositionSide::Long),
            dec!(100.40)
        );
        assert_eq!(
            normalize_price(&r, 100.42, PositionSide::Short),
            dec!(100.50)
        );
        // already on the grid stays put
        assert_eq!(
            normalize_price(&r, 100.40, PositionSide::Long),
            dec!(100.40)
        );
    }

    #[test]
    fn leverage_ladder_caps_and_falls_back() {
        // S6: bracket caps the ladder below the requested 20x
        assert_eq!(leverage_candidates(20, Some(10)), vec![10, 8, 5, 3, 2, 1]);
        assert_eq!(
            leverage_candidates(20, None),
            vec![20, 15, 12, 10, 8, 5, 3, 2, 1]
        );
        // the hard ceiling applies even when the bracket allows more
        assert_eq!(
            leverage_candidates(50, Some(125)),
            vec![20, 15, 12, 10, 8, 5, 3, 2, 1]
        );
        // a sub-cap target is tried first, then the surviving fallbacks
        assert_eq!(
            leverage_candidates(7, Some(10)),
            vec![7, 10, 8, 5, 3, 2, 1]
        );
        assert_eq!(leverage_candidates(1, Some(1)), vec![1]);
    }

    #[test]
    fn spread_bps_sane() {
        let spread = spread_bps(100.0, 100.06).unwrap();
        assert!((spread - 5.9982).abs() < 0.001);
        assert!(spread_bps(0.0, 1.0).is_none());
        assert!(spread_bps(2.0, 1.0).is_none());
    }

    fn income(tran_id: i64, income_type: &str, amount: &str, time: i64) -> IncomeRecord {
        IncomeRecord {
            symbol: Some("BTCUSDT".into()),
            income_type: income_type.into(),
            income: amount.into(),
            time,
            tran_id,
        }
    }

    #[test]
    fn income_replay_is_idempotent() {
        let mut stats = IncomeStats::default();
        let mut seen = HashSet::new();
        let mut cursor = 0i64;
        let records = vec![
            income(1, "REALIZED_PNL", "1.5", 100),
            income(2, "COMMISSION", "-0.1", 110),
            income(3, "FUNDING_FEE", "-0.02", 120),
            income(4, "TRANSFER", "5.0", 130),
        ];
        apply_income_records(&mut stats, &mut seen, &mut cursor, &records);
        assert_eq!(stats.events, 4);
        assert!((stats.realized_pnl_usd - 1.5).abs() < 1e-12);
        assert!((stats.commission_usd + 0.1).abs() < 1e-12);
        assert!((stats.funding_usd + 0.02).abs() < 1e-12);
        assert!((stats.net_usd - 6.38).abs() < 1e-12);
        assert_eq!(cursor, 131);

        // replaying the same rows changes nothing
        let snapshot = stats.clone();
        apply_income_records(&mut stats, &mut seen, &mut cursor, &records);
        assert_eq!(stats.events, snapshot.events);
        assert!((stats.net_usd - snapshot.net_usd).abs() < 1e-12);
        assert_eq!(cursor, 131);
    }

    fn risk_entry(amount: &str, position_side: Option<&str>) -> PositionRiskEntry {
        PositionRiskEntry {
            symbol: "BTCUSDT".into(),
            position_amt: amount.into(),
            entry_price: "100.5".into(),
            mark_price: "101.0".into(),
            unrealized_profit: "0.95".into(),
            notional: Some("201.0".into()),
            isolated_margin: Some("10.0".into()),
            leverage: Some("20".into()),
            margin_type: Some("isolated".into()),
            position_side: position_side.map(|s| s.into()),
        }
    }

    #[test]
    fn position_side_derivation() {
        // one-way: sign of the amount
        let (pos, tracked) = reconcile_entry(&risk_entry("-2.0", Some("BOTH")), false).unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(tracked.quantity, 2.0);
        assert_eq!(pos.margin_usd, 10.0);

        // hedge: explicit positionSide
        let (pos, _) = reconcile_entry(&risk_entry("2.0", Some("SHORT")), true).unwrap();
        assert_eq!(pos.side, PositionSide::Short);

        // flat rows drop
        assert!(reconcile_entry(&risk_entry("0.0", Some("BOTH")), false).is_none());
    }

    #[test]
    fn margin_noop_detection() {
        let by_code = VenueError {
            code: Some(ERR_MARGIN_NO_CHANGE),
            http_status: Some(400),
            message: "whatever".into(),
        };
        let by_message = VenueError {
            code: None,
            http_status: Some(400),
            message: "No need to change margin type.".into(),
        };
        let other = VenueError {
            code: Some(-1000),
            http_status: Some(400),
            message: "nope".into(),
        };
        assert!(margin_change_is_noop(&by_code));
        assert!(margin_change_is_noop(&by_message));
        assert!(!margin_change_is_noop(&other));
    }
}
