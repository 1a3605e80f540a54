use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use common::{
    now_ms, Error, ExchangeClient, ExchangePosition, ExecutionParams, Position, RestSettings,
    Result, Signal, TradeRecord, TradeSide,
};

/// Positions smaller than this are treated as flat.
const MIN_POSITION_AMT: f64 = 1e-4;

/// Signed REST client for Binance USDⓈ-M futures. Used for order placement,
/// protective stops and position queries.
pub struct FuturesClient {
    symbol: String,
    api_key: String,
    secret: String,
    settings: RestSettings,
    params: ExecutionParams,
    http: Client,
}

impl FuturesClient {
    pub fn new(symbol: impl Into<String>, settings: RestSettings, params: ExecutionParams) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("BINANCE_API_KEY is required for live trading".into()))?;
        let secret = settings
            .api_secret
            .clone()
            .ok_or_else(|| Error::Config("BINANCE_API_SECRET is required for live trading".into()))?;
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            symbol: symbol.into(),
            api_key,
            secret,
            settings,
            params,
            http,
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid API secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn signed(&self, method: Method, path: &str, params: &str) -> Result<String> {
        let ts = Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("recvWindow={}&timestamp={ts}", self.settings.recv_window)
        } else {
            format!("{params}&recvWindow={}&timestamp={ts}", self.settings.recv_window)
        };
        let signature = self.sign(&query)?;
        let url = format!(
            "{}{path}?{query}&signature={signature}",
            self.settings.base_url
        );

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    /// Set the configured leverage. Failure is only a warning: the account
    /// keeps whatever leverage it already had.
    pub async fn apply_leverage(&self) {
        let params = format!("symbol={}&leverage={}", self.symbol, self.params.leverage);
        match self.signed(Method::POST, "/fapi/v1/leverage", &params).await {
            Ok(_) => info!(symbol = %self.symbol, leverage = self.params.leverage, "Leverage applied"),
            Err(e) => warn!(symbol = %self.symbol, error = %e, "Failed to change leverage"),
        }
    }

    /// Margin available for new positions, falling back to the wallet balance.
    pub async fn balance(&self) -> Result<f64> {
        let body = self.signed(Method::GET, "/fapi/v2/account", "").await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| Error::Exchange(e.to_string()))?;
        let available = parse_num(&account.available_balance)?;
        if available > 0.0 {
            return Ok(available);
        }
        parse_num(&account.total_wallet_balance)
    }

    pub async fn calc_qty(&self, price: f64) -> Result<f64> {
        if price <= 0.0 {
            return Ok(0.0);
        }
        let balance = self.balance().await?;
        Ok(round_qty(
            balance * self.params.max_position_pct / price,
            self.settings.qty_precision,
        ))
    }

    pub async fn place_market(&self, side: TradeSide, qty: f64, reduce_only: bool) -> Result<OrderResponse> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&reduceOnly={reduce_only}",
            self.symbol,
            side.order_side(),
            format_decimal(qty, self.settings.qty_precision),
        );
        debug!(symbol = %self.symbol, side = %side, qty, reduce_only, "Placing market order");
        let body = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        serde_json::from_str(&body).map_err(|e| Error::Exchange(e.to_string()))
    }

    /// Cancel resting orders (including armed stops) for the symbol.
    pub async fn cancel_open_orders(&self) -> Result<()> {
        let params = format!("symbol={}", self.symbol);
        self.signed(Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await
            .map(|_| ())
    }

    /// Close the whole exchange position with a reduce-only market order.
    /// `Ok(None)` when nothing is open.
    pub async fn close_all_position(&self, side: TradeSide) -> Result<Option<(f64, OrderResponse)>> {
        let Some(position) = self.open_position().await? else {
            return Ok(None);
        };
        if let Err(e) = self.cancel_open_orders().await {
            warn!(error = %e, "Failed to cancel resting orders before close");
        }
        let order = self.place_market(side, position.quantity, true).await?;
        Ok(Some((position.quantity, order)))
    }

    /// Arm a close-position STOP_MARKET order `stop_loss_pct` away from entry.
    pub async fn place_stop_loss(&self, position: Position, entry_price: f64) -> Result<()> {
        let Some((side, stop)) = stop_price(position, entry_price, self.params.stop_loss_pct) else {
            return Ok(());
        };
        let params = format!(
            "symbol={}&side={side}&type=STOP_MARKET&stopPrice={}&closePosition=true&workingType={}",
            self.symbol,
            format_decimal(stop, self.settings.price_round),
            self.settings.stop_loss_working_type,
        );
        self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        info!(symbol = %self.symbol, %position, stop, "Stop-loss armed");
        Ok(())
    }

    async fn open_leg(&self, side: TradeSide, price: f64) -> Result<Option<TradeRecord>> {
        let qty = self.calc_qty(price).await?;
        if qty <= 0.0 {
            warn!(side = %side, price, "Computed quantity is zero, not opening");
            return Ok(None);
        }
        let order = self.place_market(side, qty, false).await?;

        if self.params.stop_loss_enabled {
            let position = if side.order_side() == "BUY" {
                Position::Long
            } else {
                Position::Short
            };
            if let Err(e) = self.place_stop_loss(position, price).await {
                warn!(error = %e, "Failed to arm stop-loss");
            }
        }
        Ok(Some(order.into_trade(side, qty, price)))
    }
}

#[async_trait]
impl ExchangeClient for FuturesClient {
    async fn execute(&self, signal: Signal, price: f64) -> Result<Vec<TradeRecord>> {
        let mut trades = Vec::new();

        if let Some(side) = signal.close_side() {
            match self.close_all_position(side).await? {
                Some((qty, order)) => trades.push(order.into_trade(side, qty, price)),
                None => info!(%signal, "No exchange position to close"),
            }
        }

        if let Some(side) = signal.open_side() {
            match self.open_leg(side, price).await {
                Ok(Some(trade)) => trades.push(trade),
                Ok(None) => {}
                // The closing leg already went through; report it rather than
                // losing it behind the error.
                Err(e) if !trades.is_empty() => {
                    error!(%signal, error = %e, "Opening leg failed after close");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(trades)
    }

    async fn open_position(&self) -> Result<Option<ExchangePosition>> {
        let params = format!("symbol={}", self.symbol);
        let body = self.signed(Method::GET, "/fapi/v2/positionRisk", &params).await?;
        let risks: Vec<PositionRisk> =
            serde_json::from_str(&body).map_err(|e| Error::Exchange(e.to_string()))?;

        for risk in risks.iter().filter(|r| r.symbol == self.symbol) {
            let amt = parse_num(&risk.position_amt)?;
            if amt.abs() > MIN_POSITION_AMT {
                return Ok(Some(ExchangePosition {
                    position: if amt > 0.0 { Position::Long } else { Position::Short },
                    quantity: amt.abs(),
                    entry_price: parse_num(&risk.entry_price)?,
                }));
            }
        }
        Ok(None)
    }
}

/// Floor to `precision` decimals, never below one step for a positive input.
pub fn round_qty(qty: f64, precision: u32) -> f64 {
    if !(qty > 0.0) {
        return 0.0;
    }
    let factor = 10f64.powi(precision as i32);
    ((qty * factor).floor() / factor).max(1.0 / factor)
}

/// Order side and trigger price of the protective stop for `position`.
pub fn stop_price(position: Position, entry_price: f64, pct: f64) -> Option<(&'static str, f64)> {
    match position {
        Position::Long => Some(("SELL", entry_price * (1.0 - pct))),
        Position::Short => Some(("BUY", entry_price * (1.0 + pct))),
        Position::Flat => None,
    }
}

fn format_decimal(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, value)
}

fn parse_num(s: &str) -> Result<f64> {
    s.parse::<f64>()
        .map_err(|e| Error::Exchange(format!("Bad numeric field '{s}': {e}")))
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    #[serde(default)]
    pub status: Option<String>,
}

impl OrderResponse {
    fn into_trade(self, side: TradeSide, qty: f64, price: f64) -> TradeRecord {
        TradeRecord {
            ts: now_ms(),
            side,
            qty,
            price: Some(price),
            order_id: Some(self.order_id.to_string()),
            status: self.status,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    available_balance: String,
    total_wallet_balance: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qty_is_floored_with_one_step_minimum() {
        assert_eq!(round_qty(1.23456, 3), 1.234);
        assert_eq!(round_qty(0.0004, 3), 0.001);
        assert_eq!(round_qty(0.0, 3), 0.0);
        assert_eq!(round_qty(-1.0, 3), 0.0);
        assert_eq!(round_qty(f64::NAN, 3), 0.0);
    }

    #[test]
    fn stop_sits_on_the_losing_side_of_entry() {
        let (side, price) = stop_price(Position::Long, 100.0, 0.02).unwrap();
        assert_eq!(side, "SELL");
        assert!((price - 98.0).abs() < 1e-9);

        let (side, price) = stop_price(Position::Short, 100.0, 0.02).unwrap();
        assert_eq!(side, "BUY");
        assert!((price - 102.0).abs() < 1e-9);

        assert!(stop_price(Position::Flat, 100.0, 0.02).is_none());
    }

    #[test]
    fn decimals_are_formatted_to_precision() {
        assert_eq!(format_decimal(0.1, 3), "0.100");
        assert_eq!(format_decimal(2345.678, 2), "2345.68");
    }

    #[test]
    fn order_response_tolerates_missing_status() {
        let order: OrderResponse = serde_json::from_str(r#"{"orderId":42,"symbol":"ETHUSDT"}"#).unwrap();
        let trade = order.into_trade(TradeSide::SellOpen, 0.5, 2000.0);
        assert_eq!(trade.order_id.as_deref(), Some("42"));
        assert_eq!(trade.status, None);
        assert_eq!(trade.side, TradeSide::SellOpen);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let settings = RestSettings {
            base_url: "https://fapi.binance.com".into(),
            api_key: None,
            api_secret: None,
            recv_window: 5000,
            http_timeout: std::time::Duration::from_secs(30),
            qty_precision: 3,
            price_round: 2,
            stop_loss_working_type: "CONTRACT_PRICE".into(),
        };
        assert!(matches!(
            FuturesClient::new("ETHUSDT", settings, ExecutionParams::default()),
            Err(Error::Config(_))
        ));
    }
}
