// Signed futures REST client (HMAC-SHA256 query signing)

use crate::models::{
    BookTickerResponse, ExchangeInfoResponse, IncomeRecord, LeverageBracketResponse,
    OrderResponse, PositionModeResponse, PositionRiskEntry, VenueErrorBody,
};
use crate::types::Candle;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// Venue-facing failure. `code` carries the numeric code from a `{code,msg}`
/// envelope when one was present; retry logic branches on it.
#[derive(Debug, Clone)]
pub struct VenueError {
    pub code: Option<i64>,
    pub http_status: Option<u16>,
    pub message: String,
}

impl VenueError {
    fn transport(err: impl fmt::Display) -> Self {
        Self {
            code: None,
            http_status: None,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.http_status) {
            (Some(code), Some(status)) => {
                write!(f, "venue error {code} (http {status}): {}", self.message)
            }
            (Some(code), None) => write!(f, "venue error {code}: {}", self.message),
            (None, Some(status)) => write!(f, "http {status}: {}", self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for VenueError {}

pub type ApiResult<T> = Result<T, VenueError>;

/// Thin signed client over the futures REST API. Credentials are immutable
/// after construction; public endpoints work without them.
pub struct FuturesApi {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl FuturesApi {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, api_secret: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            api_secret: api_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    // -- public endpoints ---------------------------------------------------

    /// Boot-time history hydration: last `limit` klines for one symbol.
    /// Rows are `[openTime, open, high, low, close, volume, closeTime, ...]`
    /// with numeric strings; non-finite rows are dropped.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ApiResult<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            interval,
            limit
        );
        let rows: Vec<serde_json::Value> = self.get_json(&url).await?;
        let candles = rows
            .into_iter()
            .filter_map(|row| {
                let arr = row.as_array()?;
                if arr.len() < 7 {
                    return None;
                }
                let num = |v: &serde_json::Value| -> Option<f64> {
                    v.as_f64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                        .filter(|n| n.is_finite())
                };
                Some(Candle {
                    open_time: arr[0].as_i64()?,
                    open: num(&arr[1])?,
                    high: num(&arr[2])?,
                    low: num(&arr[3])?,
                    close: num(&arr[4])?,
                    volume: num(&arr[5])?,
                    close_time: arr[6].as_i64()?,
                })
            })
            .collect();
        Ok(candles)
    }

    pub async fn exchange_info(&self) -> ApiResult<ExchangeInfoResponse> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        self.get_json(&url).await
    }

    pub async fn book_ticker(&self, symbol: &str) -> ApiResult<BookTickerResponse> {
        let url = format!(
            "{}/fapi/v1/ticker/bookTicker?symbol={}",
            self.base_url,
            symbol.to_uppercase()
        );
        self.get_json(&url).await
    }

    // -- signed endpoints ---------------------------------------------------

    pub async fn position_mode(&self) -> ApiResult<bool> {
        let resp: PositionModeResponse = self
            .signed(Method::GET, "/fapi/v1/positionSide/dual", Vec::new())
            .await?;
        Ok(resp.dual_side_position)
    }

    pub async fn leverage_brackets(&self, symbol: &str) -> ApiResult<Vec<LeverageBracketResponse>> {
        let params = vec![("symbol".to_string(), symbol.to_uppercase())];
        self.signed(Method::GET, "/fapi/v1/leverageBracket", params)
            .await
    }

    pub async fn set_margin_type(&self, symbol: &str, isolated: bool) -> ApiResult<()> {
        let params = vec![
            ("symbol".to_string(), symbol.to_uppercase()),
            (
                "marginType".to_string(),
                if isolated { "ISOLATED" } else { "CROSSED" }.to_string(),
            ),
        ];
        // Success body is itself a {code, msg} envelope; only the HTTP layer
        // decides success here.
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/marginType", params).await?;
        Ok(())
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> ApiResult<()> {
        let params = vec![
            ("symbol".to_string(), symbol.to_uppercase()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/leverage", params).await?;
        Ok(())
    }

    pub async fn place_order(&self, params: Vec<(String, String)>) -> ApiResult<OrderResponse> {
        self.signed(Method::POST, "/fapi/v1/order", params).await
    }

    pub async fn query_order(&self, symbol: &str, order_id: i64) -> ApiResult<OrderResponse> {
        let params = vec![
            ("symbol".to_string(), symbol.to_uppercase()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.signed(Method::GET, "/fapi/v1/order", params).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> ApiResult<OrderResponse> {
        let params = vec![
            ("symbol".to_string(), symbol.to_uppercase()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.signed(Method::DELETE, "/fapi/v1/order", params).await
    }

    pub async fn position_risk(&self) -> ApiResult<Vec<PositionRiskEntry>> {
        self.signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await
    }

    pub async fn income_since(&self, start_time: i64, limit: usize) -> ApiResult<Vec<IncomeRecord>> {
        let params = vec![
            ("startTime".to_string(), start_time.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        self.signed(Method::GET, "/fapi/v1/income", params).await
    }

    // -- plumbing -----------------------------------------------------------

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(VenueError::transport)?;
        Self::take_json(resp).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> ApiResult<T> {
        let api_key = self.api_key.as_ref().ok_or_else(|| VenueError {
            code: None,
            http_status: None,
            message: "API key required for signed request".into(),
        })?;
        let api_secret = self.api_secret.as_ref().ok_or_else(|| VenueError {
            code: None,
            http_status: None,
            message: "API secret required for signed request".into(),
        })?;

        let query = signed_query(api_secret, params, chrono::Utc::now().timestamp_millis())
            .map_err(VenueError::transport)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(VenueError::transport)?;
        Self::take_json(resp).await
    }

    async fn take_json<T: DeserializeOwned>(resp: reqwest::Response) -> ApiResult<T> {
        let status = resp.status();
        let body = resp.text().await.map_err(VenueError::transport)?;

        if !status.is_success() {
            if let Ok(envelope) = serde_json::from_str::<VenueErrorBody>(&body) {
                return Err(VenueError {
                    code: Some(envelope.code),
                    http_status: Some(status.as_u16()),
                    message: envelope.msg,
                });
            }
            return Err(VenueError {
                code: None,
                http_status: Some(status.as_u16()),
                message: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|e| VenueError {
            code: None,
            http_status: Some(status.as_u16()),
            message: format!("unexpected response shape: {e}"),
        })
    }
}

/// Build the signed query string: url-encoded params with `timestamp` and
/// `recvWindow` appended, then `signature=hex(hmac_sha256(query))` last.
fn signed_query(
    api_secret: &str,
    mut params: Vec<(String, String)>,
    timestamp_ms: i64,
) -> anyhow::Result<String> {
    params.push(("timestamp".into(), timestamp_ms.to_string()));
    params.push(("recvWindow".into(), RECV_WINDOW_MS.to_string()));
    let query = serde_urlencoded::to_string(&params)?;
    Ok(format!("{query}&signature={}", sign_query(api_secret, &query)))
}

fn sign_query(api_secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vector from the venue's API documentation.
    const DOC_SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
    const DOC_QUERY: &str = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
    const DOC_SIGNATURE: &str = "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71";

    #[test]
    fn hmac_signature_matches_reference_vector() {
        assert_eq!(sign_query(DOC_SECRET, DOC_QUERY), DOC_SIGNATURE);
    }

    #[test]
    fn signed_query_appends_timestamp_recv_window_then_signature() {
        let params = vec![("symbol".to_string(), "BTCUSDT".to_string())];
        let query = signed_query("secret", params, 1_700_000_000_000).unwrap();
        assert!(query.starts_with("symbol=BTCUSDT&timestamp=1700000000000&recvWindow=5000"));
        let (base, sig) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(sig, sign_query("secret", base));
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn venue_error_formats_code_and_status() {
        let err = VenueError {
            code: Some(-4028),
            http_status: Some(400),
            message: "Invalid leverage".into(),
        };
        let text = err.to_string();
        assert!(text.contains("-4028"));
        assert!(text.contains("400"));
    }
}
