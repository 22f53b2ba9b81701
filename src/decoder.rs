// Feed decoder: one raw stream frame -> at most one MarketEvent

use crate::models::{AggTradeEvent, KlineEvent, MarkPriceEvent, VenueErrorBody};
use crate::types::{Candle, MarketEvent, TradeSide};
use anyhow::{anyhow, Result};
use serde_json::Value;

/// Outcome of decoding a single frame.
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Event(MarketEvent),
    /// Server-side error envelope (`{code, msg}`), surfaced to the supervisor.
    VenueError { code: i64, msg: String },
    /// Valid JSON the engine does not care about (unknown discriminator,
    /// non-finite numerics, subscription acks).
    Ignored,
}

/// Decode one text frame from the multiplexed stream.
///
/// Accepts both the combined-stream envelope `{"stream":..,"data":{..}}` and
/// a bare payload. Malformed JSON is an error; unknown event types are
/// dropped silently.
pub fn decode_frame(raw: &str) -> Result<DecodedFrame> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| anyhow!("malformed stream frame: {e}"))?;

    if let Ok(err) = serde_json::from_value::<VenueErrorBody>(value.clone()) {
        return Ok(DecodedFrame::VenueError {
            code: err.code,
            msg: err.msg,
        });
    }

    let payload = value.get("data").unwrap_or(&value);
    let event_type = match payload.get("e").and_then(|v| v.as_str()) {
        Some(e) => e,
        None => return Ok(DecodedFrame::Ignored),
    };

    let decoded = match event_type {
        "trade" | "aggTrade" => decode_trade(payload),
        "markPriceUpdate" => decode_mark(payload),
        "kline" => decode_kline(payload),
        _ => None,
    };

    Ok(match decoded {
        Some(event) => DecodedFrame::Event(event),
        None => DecodedFrame::Ignored,
    })
}

fn decode_trade(payload: &Value) -> Option<MarketEvent> {
    let ev: AggTradeEvent = serde_json::from_value(payload.clone()).ok()?;
    let price = finite(ev.price.parse().ok()?)?;
    let qty = finite(ev.qty.parse().ok()?)?;
    let side = if ev.is_buyer_maker {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };
    Some(MarketEvent::Trade {
        symbol: ev.symbol.to_lowercase(),
        price,
        qty,
        ts: ev.trade_time,
        side,
    })
}

fn decode_mark(payload: &Value) -> Option<MarketEvent> {
    let ev: MarkPriceEvent = serde_json::from_value(payload.clone()).ok()?;
    let price = finite(ev.mark_price.parse().ok()?)?;
    Some(MarketEvent::Mark {
        symbol: ev.symbol.to_lowercase(),
        price,
        ts: ev.event_time,
    })
}

fn decode_kline(payload: &Value) -> Option<MarketEvent> {
    let ev: KlineEvent = serde_json::from_value(payload.clone()).ok()?;
    let k = ev.kline;
    let candle = Candle {
        open_time: k.open_time,
        open: finite(k.open.parse().ok()?)?,
        high: finite(k.high.parse().ok()?)?,
        low: finite(k.low.parse().ok()?)?,
        close: finite(k.close.parse().ok()?)?,
        volume: finite(k.volume.parse().ok()?)?,
        close_time: k.close_time,
    };
    if candle.close_time <= candle.open_time {
        return None;
    }
    Some(MarketEvent::Kline {
        symbol: ev.symbol.to_lowercase(),
        candle,
        is_closed: k.is_closed,
    })
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg_trade_frame(enveloped: bool) -> String {
        let data = r#"{"e":"aggTrade","E":1700000000500,"s":"BTCUSDT","a":1,"p":"42000.50","q":"0.250","f":1,"l":1,"T":1700000000400,"m":true}"#;
        if enveloped {
            format!(r#"{{"stream":"btcusdt@aggTrade","data":{data}}}"#)
        } else {
            data.to_string()
        }
    }

    #[test]
    fn decodes_enveloped_and_bare_agg_trade() {
        for enveloped in [true, false] {
            let frame = agg_trade_frame(enveloped);
            match decode_frame(&frame).unwrap() {
                DecodedFrame::Event(MarketEvent::Trade {
                    symbol,
                    price,
                    qty,
                    ts,
                    side,
                }) => {
                    assert_eq!(symbol, "btcusdt");
                    assert_eq!(price, 42000.50);
                    assert_eq!(qty, 0.250);
                    assert_eq!(ts, 1700000000400);
                    // buyer was maker -> aggressor sold
                    assert_eq!(side, TradeSide::Sell);
                }
                other => panic!("unexpected decode: {other:?}"),
            }
        }
    }

    #[test]
    fn decodes_mark_price() {
        let frame = r#"{"e":"markPriceUpdate","E":1700000001000,"s":"ETHUSDT","p":"2200.12","r":"0.0001"}"#;
        match decode_frame(frame).unwrap() {
            DecodedFrame::Event(MarketEvent::Mark { symbol, price, ts }) => {
                assert_eq!(symbol, "ethusdt");
                assert_eq!(price, 2200.12);
                assert_eq!(ts, 1700000001000);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_closed_kline() {
        let frame = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000299999,"s":"BTCUSDT","i":"5m","o":"100.0","h":"101.0","l":"99.0","c":"100.5","v":"12.5","x":true}}"#;
        match decode_frame(frame).unwrap() {
            DecodedFrame::Event(MarketEvent::Kline {
                symbol,
                candle,
                is_closed,
            }) => {
                assert_eq!(symbol, "btcusdt");
                assert!(is_closed);
                assert_eq!(candle.close, 100.5);
                assert_eq!(candle.close_time, 1700000299999);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn surfaces_venue_error_envelope() {
        let frame = r#"{"code":-1121,"msg":"Invalid symbol."}"#;
        match decode_frame(frame).unwrap() {
            DecodedFrame::VenueError { code, msg } => {
                assert_eq!(code, -1121);
                assert_eq!(msg, "Invalid symbol.");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn drops_unknown_discriminator() {
        let frame = r#"{"e":"bookTicker","s":"BTCUSDT","b":"1.0","a":"2.0"}"#;
        assert!(matches!(decode_frame(frame).unwrap(), DecodedFrame::Ignored));
    }

    #[test]
    fn drops_non_finite_numbers() {
        let frame = r#"{"e":"aggTrade","s":"BTCUSDT","p":"NaN","q":"1.0","T":1,"m":false}"#;
        assert!(matches!(decode_frame(frame).unwrap(), DecodedFrame::Ignored));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(decode_frame("{not json").is_err());
    }
}
