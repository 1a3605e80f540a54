use std::sync::Arc;

use tracing::{error, info, warn};

use common::{now_ms, ExchangeClient, Signal, StateStore, TradeRecord, TradingMode};

/// Hands strategy signals to the execution collaborator and records the
/// resulting trades.
///
/// This is the ONLY component that calls `ExchangeClient::execute`.
/// Failures are logged and written to the error log, never retried.
pub struct SignalExecutor {
    client: Arc<dyn ExchangeClient>,
    store: Arc<dyn StateStore>,
    mode: TradingMode,
}

impl SignalExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>, store: Arc<dyn StateStore>, mode: TradingMode) -> Self {
        Self {
            client,
            store,
            mode,
        }
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    /// Execute `signal` at `price` and return the trades that were placed.
    pub async fn dispatch(&self, signal: Signal, price: f64) -> Vec<TradeRecord> {
        info!(mode = %self.mode, %signal, price, "Executing signal");

        let trades = match self.client.execute(signal, price).await {
            Ok(trades) => trades,
            Err(e) => {
                error!(%signal, error = %e, "Signal execution failed");
                if let Err(log_err) = self.store.log_error(now_ms(), "order", &e.to_string()).await {
                    warn!(error = %log_err, "Failed to record execution error");
                }
                return Vec::new();
            }
        };

        // Sequential: a closing leg must mark its open trade before the
        // reversal's opening leg is written.
        for trade in &trades {
            info!(
                side = %trade.side,
                qty = trade.qty,
                price = ?trade.price,
                order_id = ?trade.order_id,
                status = ?trade.status,
                "Trade placed"
            );
            if let Err(e) = self.store.log_trade(trade).await {
                error!(side = %trade.side, error = %e, "Failed to persist trade");
                continue;
            }
            if trade.side.closes().is_some() {
                if let Err(e) = self.store.mark_open_trade_over(trade.side).await {
                    error!(side = %trade.side, error = %e, "Failed to mark open trade as over");
                }
            }
        }
        trades
    }
}
