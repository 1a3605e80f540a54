use async_trait::async_trait;

use crate::{ExchangePosition, Result, Signal, TradeRecord};

/// Execution collaborator: turns a strategy signal into exchange orders.
///
/// `FuturesClient` implements this for live trading.
/// `PaperClient` implements this for simulation.
///
/// Implementations own sizing, lot/notional rounding, order placement and
/// protective stops. The caller logs failures and never retries; the
/// strategy state has already moved on when `execute` is called.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Act on `signal` at the current `price` and return the trades placed,
    /// in placement order.
    async fn execute(&self, signal: Signal, price: f64) -> Result<Vec<TradeRecord>>;

    /// Query the position currently held on the exchange, if any.
    async fn open_position(&self) -> Result<Option<ExchangePosition>>;
}
