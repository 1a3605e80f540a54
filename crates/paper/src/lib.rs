use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{
    now_ms, ExchangeClient, ExchangePosition, ExecutionParams, Result, Signal, TradeRecord,
    TradeSide,
};

const SIMULATED_ORDER_ID: &str = "SIMULATED";
const FILLED: &str = "FILLED";

/// Simulated execution client for paper trading.
///
/// Every leg fills instantly at the signal price. Entries are sized as
/// `balance × max_position_pct / price`. No request ever leaves the process.
pub struct PaperClient {
    /// Simulated balance in USDT. Fixed: paper PnL is not tracked.
    balance_usd: f64,
    params: ExecutionParams,
    position: Arc<RwLock<Option<ExchangePosition>>>,
}

impl PaperClient {
    pub fn new(balance_usd: f64, params: ExecutionParams) -> Self {
        info!(
            balance = balance_usd,
            max_position_pct = params.max_position_pct,
            "PaperClient initialized"
        );
        Self {
            balance_usd,
            params,
            position: Arc::new(RwLock::new(None)),
        }
    }

    fn qty_for(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        self.balance_usd * self.params.max_position_pct / price
    }

    fn record(side: TradeSide, qty: f64, price: f64) -> TradeRecord {
        TradeRecord {
            ts: now_ms(),
            side,
            qty,
            price: Some(price),
            order_id: Some(SIMULATED_ORDER_ID.to_string()),
            status: Some(FILLED.to_string()),
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperClient {
    async fn execute(&self, signal: Signal, price: f64) -> Result<Vec<TradeRecord>> {
        let mut position = self.position.write().await;
        let mut trades = Vec::with_capacity(2);

        if let Some(side) = signal.close_side() {
            let closed = position.take();
            if closed.is_none() {
                debug!(%signal, "No simulated position to close");
            }
            let qty = closed.map(|p| p.quantity).unwrap_or(0.0);
            trades.push(Self::record(side, qty, price));
        }

        if let Some(side) = signal.open_side() {
            let qty = self.qty_for(price);
            if qty > 0.0 {
                *position = Some(ExchangePosition {
                    position: signal.target(),
                    quantity: qty,
                    entry_price: price,
                });
                trades.push(Self::record(side, qty, price));
            } else {
                warn!(%signal, price, "Simulated quantity is zero, not opening");
            }
        }

        debug!(%signal, price, legs = trades.len(), "Paper fill simulated");
        Ok(trades)
    }

    async fn open_position(&self) -> Result<Option<ExchangePosition>> {
        Ok(*self.position.read().await)
    }
}
