use async_trait::async_trait;

use crate::{Bands, Bar, Result, Signal, StrategyState, TradeRecord, TradeSide};

/// Persistence contract used by the bar pipeline.
///
/// `save_strategy_state` failures must be surfaced by the caller. The
/// signal/trade/error sinks are fire-and-forget: callers log their failures
/// and keep going.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Idempotent upsert keyed by `open_time`.
    async fn insert_or_replace_bar(&self, bar: &Bar) -> Result<()>;

    /// One row per closed bar time.
    async fn upsert_indicator(&self, open_time: i64, bands: &Bands) -> Result<()>;

    /// Append a state snapshot.
    async fn save_strategy_state(&self, ts: i64, state: &StrategyState) -> Result<()>;

    /// Most recently appended snapshot, if any.
    async fn load_latest_strategy_state(&self) -> Result<Option<StrategyState>>;

    /// Most recent `limit` bars, oldest first.
    async fn recent_bars(&self, limit: i64) -> Result<Vec<Bar>>;

    async fn log_signal(&self, ts: i64, signal: Signal, price: f64) -> Result<()>;

    async fn log_trade(&self, trade: &TradeRecord) -> Result<()>;

    /// Mark the latest open trade closed by `close_side` as `OVER`.
    async fn mark_open_trade_over(&self, close_side: TradeSide) -> Result<()>;

    async fn log_error(&self, ts: i64, origin: &str, error: &str) -> Result<()>;
}
