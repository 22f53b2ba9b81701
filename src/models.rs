// Wire models for the market stream and the signed futures REST API

use serde::Deserialize;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Stream payloads
// ---------------------------------------------------------------------------

/// Venue error envelope, also seen on the stream (`{"code":..,"msg":".."}`)
#[derive(Debug, Clone, Deserialize)]
pub struct VenueErrorBody {
    pub code: i64,
    pub msg: String,
}

/// `aggTrade` / `trade` stream payload. Numeric fields arrive as strings and
/// are parsed at the decoder edge.
#[derive(Debug, Clone, Deserialize)]
pub struct AggTradeEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub qty: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// `markPriceUpdate` stream payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: String,
    #[serde(rename = "E")]
    pub event_time: i64,
}

/// `kline` stream payload wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

// ---------------------------------------------------------------------------
// REST responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSymbol {
    pub symbol: String,
    pub filters: Vec<SymbolFilter>,
}

/// One exchange filter; per-type fields are kept loose and read by name
/// (LOT_SIZE → stepSize/minQty, PRICE_FILTER → tickSize).
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolFilter {
    #[serde(rename = "filterType")]
    pub filter_type: String,
    #[serde(flatten)]
    pub data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeverageBracketResponse {
    pub symbol: String,
    pub brackets: Vec<LeverageBracket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeverageBracket {
    #[serde(rename = "initialLeverage")]
    pub initial_leverage: u32,
}

/// GET /fapi/v1/positionSide/dual
#[derive(Debug, Clone, Deserialize)]
pub struct PositionModeResponse {
    #[serde(rename = "dualSidePosition")]
    pub dual_side_position: bool,
}

/// POST/GET /fapi/v1/order response (subset the adapter cares about).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    #[serde(rename = "executedQty")]
    pub executed_qty: String,
    #[serde(rename = "avgPrice")]
    pub avg_price: Option<String>,
    #[serde(rename = "origQty")]
    pub orig_qty: Option<String>,
}

/// GET /fapi/v1/ticker/bookTicker
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerResponse {
    pub symbol: String,
    #[serde(rename = "bidPrice")]
    pub bid_price: String,
    #[serde(rename = "askPrice")]
    pub ask_price: String,
}

/// GET /fapi/v2/positionRisk entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRiskEntry {
    pub symbol: String,
    #[serde(rename = "positionAmt")]
    pub position_amt: String,
    #[serde(rename = "entryPrice")]
    pub entry_price: String,
    #[serde(rename = "markPrice")]
    pub mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: String,
    #[serde(rename = "notional")]
    pub notional: Option<String>,
    #[serde(rename = "isolatedMargin")]
    pub isolated_margin: Option<String>,
    pub leverage: Option<String>,
    #[serde(rename = "marginType")]
    pub margin_type: Option<String>,
    #[serde(rename = "positionSide")]
    pub position_side: Option<String>,
}

/// GET /fapi/v1/income ledger row.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomeRecord {
    pub symbol: Option<String>,
    #[serde(rename = "incomeType")]
    pub income_type: String,
    pub income: String,
    pub time: i64,
    #[serde(rename = "tranId")]
    pub tran_id: i64,
}
