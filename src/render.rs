// Renderer surface: one compact line per symbol per tick

use crate::trading::{IncomeStats, LivePosition};
use crate::types::PositionSide;

/// Everything the renderer needs for one symbol. Field semantics are stable;
/// formatting is this module's concern only.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub symbol: String,
    pub mark_price: Option<f64>,
    pub trade_price: Option<f64>,
    pub last_volume_5m: Option<f64>,
    pub ms_to_next_candle: Option<i64>,
    pub plan_status: Option<String>,
    pub long_above: Option<f64>,
    pub short_below: Option<f64>,
    pub sim_side: Option<PositionSide>,
    pub sim_net_pnl_usd: Option<f64>,
    pub sim_roi_pct: Option<f64>,
    pub sim_trades: usize,
    pub sim_realized_pnl_usd: f64,
    pub note: Option<String>,
    pub live_position: Option<LivePosition>,
    pub live_income: Option<IncomeStats>,
}

pub fn render_tick(rows: &[Row]) {
    for row in rows {
        println!("{}", format_row(row));
    }
}

fn format_row(row: &Row) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(format!(
        "mark {} last {}",
        fmt_price(row.mark_price),
        fmt_price(row.trade_price)
    ));
    parts.push(format!("vol5m {}", fmt_qty(row.last_volume_5m)));
    parts.push(format!("⏱️  {}", fmt_countdown(row.ms_to_next_candle)));

    match (&row.plan_status, row.long_above, row.short_below) {
        (Some(status), Some(long), Some(short)) => {
            parts.push(format!("{status} ▲{} ▼{}", fmt_price(Some(long)), fmt_price(Some(short))));
        }
        (Some(status), _, _) => parts.push(status.clone()),
        _ => parts.push("WAIT".to_string()),
    }

    match (row.sim_side, row.sim_roi_pct, row.sim_net_pnl_usd) {
        (Some(side), Some(roi), Some(net)) => {
            parts.push(format!("sim {} {:+.2}% ({:+.4})", side.as_str(), roi, net));
        }
        _ => parts.push(format!(
            "sim flat {}t {:+.4}",
            row.sim_trades, row.sim_realized_pnl_usd
        )),
    }

    if let Some(pos) = &row.live_position {
        parts.push(format!(
            "live {} {:.6} upnl {:+.4}",
            pos.side.as_str(),
            pos.quantity,
            pos.unrealized_pnl_usd
        ));
    }
    if let Some(income) = &row.live_income {
        parts.push(format!("inc {:+.4}", income.net_usd));
    }
    if let Some(note) = &row.note {
        parts.push(note.clone());
    }

    format!("📊 {} | {}", row.symbol, parts.join(" | "))
}

fn fmt_price(price: Option<f64>) -> String {
    match price {
        Some(p) if p.is_finite() => {
            if p >= 100.0 {
                format!("{p:.2}")
            } else {
                format!("{p:.4}")
            }
        }
        _ => "--".to_string(),
    }
}

fn fmt_qty(qty: Option<f64>) -> String {
    match qty {
        Some(q) if q.is_finite() => format!("{q:.3}"),
        _ => "--".to_string(),
    }
}

fn fmt_countdown(ms: Option<i64>) -> String {
    match ms {
        Some(ms) => {
            let secs = (ms.max(0) / 1000) as u64;
            format!("{:2}m {:02}s", secs / 60, secs % 60)
        }
        None => "--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_formatting() {
        assert_eq!(fmt_countdown(Some(125_000)), " 2m 05s");
        assert_eq!(fmt_countdown(Some(0)), " 0m 00s");
        assert_eq!(fmt_countdown(None), "--");
    }

    #[test]
    fn prices_pick_precision_by_magnitude() {
        assert_eq!(fmt_price(Some(42000.123)), "42000.12");
        assert_eq!(fmt_price(Some(0.12345)), "0.1235");
        assert_eq!(fmt_price(None), "--");
        assert_eq!(fmt_price(Some(f64::NAN)), "--");
    }

    #[test]
    fn row_renders_plan_and_sim_sections() {
        let row = Row {
            symbol: "BTCUSDT".into(),
            mark_price: Some(42000.0),
            trade_price: Some(42001.0),
            last_volume_5m: Some(12.5),
            ms_to_next_candle: Some(65_000),
            plan_status: Some("SETUP".into()),
            long_above: Some(42100.0),
            short_below: Some(41900.0),
            sim_side: Some(PositionSide::Long),
            sim_net_pnl_usd: Some(0.42),
            sim_roi_pct: Some(4.2),
            ..Row::default()
        };
        let line = format_row(&row);
        assert!(line.contains("BTCUSDT"));
        assert!(line.contains("SETUP ▲42100.00 ▼41900.00"));
        assert!(line.contains("sim LONG +4.20% (+0.4200)"));
    }

    #[test]
    fn flat_row_shows_realized_stats() {
        let row = Row {
            symbol: "ETHUSDT".into(),
            sim_trades: 3,
            sim_realized_pnl_usd: -0.25,
            ..Row::default()
        };
        let line = format_row(&row);
        assert!(line.contains("sim flat 3t -0.2500"));
        assert!(line.contains("WAIT"));
    }
}
