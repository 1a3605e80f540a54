use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use common::{
    Bands, Bar, Error, Pending, Position, Result, Signal, StateStore, StrategyState, TradeRecord,
    TradeSide,
};

/// SQLite-backed implementation of the persistence contract.
///
/// The bar pipeline is the only writer of `strategy_state`; the dashboard
/// uses the read-only helpers at the bottom of this impl.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "Database ready");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests. A single connection that
    /// never expires, since every new connection would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("Database migration failed: {e}")))
    }

    // ─── Read side (dashboard) ────────────────────────────────────────────────

    pub async fn recent_signals(&self, limit: i64) -> Result<Vec<SignalRow>> {
        let rows = sqlx::query_as::<_, SignalRow>(
            "SELECT ts, signal, price FROM signals ORDER BY ts DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT ts, side, qty, price, order_id, status FROM trades ORDER BY ts DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn recent_errors(&self, limit: i64) -> Result<Vec<ErrorRow>> {
        let rows = sqlx::query_as::<_, ErrorRow>(
            "SELECT ts, where_, error FROM errors ORDER BY ts DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SignalRow {
    pub ts: i64,
    pub signal: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TradeRow {
    pub ts: i64,
    pub side: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ErrorRow {
    pub ts: i64,
    #[sqlx(rename = "where_")]
    pub origin: String,
    pub error: String,
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn insert_or_replace_bar(&self, bar: &Bar) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO klines (open_time, close_time, open, high, low, close, volume, is_closed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(bar.open_time)
        .bind(bar.close_time)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.is_closed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_indicator(&self, open_time: i64, bands: &Bands) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO indicators (open_time, ma, std, up, dn) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(open_time)
        .bind(bands.ma)
        .bind(bands.std)
        .bind(bands.up)
        .bind(bands.dn)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_strategy_state(&self, ts: i64, state: &StrategyState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_state
                (ts, position, pending, entry_price, breakout_level, breakout_up, breakout_dn, last_close_price)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(ts)
        .bind(state.position.as_str())
        .bind(state.pending.as_db())
        .bind(state.entry_price)
        .bind(state.breakout_level)
        .bind(state.breakout_up)
        .bind(state.breakout_dn)
        .bind(state.last_close_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_latest_strategy_state(&self) -> Result<Option<StrategyState>> {
        let row = sqlx::query(
            r#"
            SELECT position, pending, entry_price, breakout_level, breakout_up, breakout_dn, last_close_price
            FROM strategy_state ORDER BY id DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_state).transpose()
    }

    async fn recent_bars(&self, limit: i64) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT open_time, close_time, open, high, low, close, volume, is_closed
            FROM klines ORDER BY open_time DESC LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = rows.iter().map(decode_bar).collect::<Result<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    async fn log_signal(&self, ts: i64, signal: Signal, price: f64) -> Result<()> {
        sqlx::query("INSERT INTO signals (ts, signal, price) VALUES (?1, ?2, ?3)")
            .bind(ts)
            .bind(signal.as_str())
            .bind(price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades (ts, side, qty, price, order_id, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(trade.ts)
        .bind(trade.side.as_str())
        .bind(trade.qty)
        .bind(trade.price)
        .bind(trade.order_id.as_deref())
        .bind(trade.status.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_open_trade_over(&self, close_side: TradeSide) -> Result<()> {
        let Some([a, b]) = close_side.closes() else {
            return Ok(());
        };
        sqlx::query(
            r#"
            UPDATE trades SET status = 'OVER'
            WHERE id = (
                SELECT id FROM trades
                WHERE side IN (?1, ?2)
                  AND (status IS NULL OR status <> 'OVER')
                ORDER BY ts DESC, id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_error(&self, ts: i64, origin: &str, error: &str) -> Result<()> {
        sqlx::query("INSERT INTO errors (ts, where_, error) VALUES (?1, ?2, ?3)")
            .bind(ts)
            .bind(origin)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn decode_bar(row: &SqliteRow) -> Result<Bar> {
    Ok(Bar {
        open_time: row.try_get("open_time")?,
        close_time: row.try_get("close_time")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        is_closed: row.try_get("is_closed")?,
    })
}

/// Every column gets an explicit default so that legacy rows (NULL flags,
/// old pending labels) still load.
fn decode_state(row: &SqliteRow) -> Result<StrategyState> {
    let position: Option<String> = row.try_get("position")?;
    let position = match position.as_deref() {
        None => Position::Flat,
        Some(raw) => Position::parse(raw).unwrap_or_else(|| {
            warn!(value = raw, "Unknown stored position, defaulting to flat");
            Position::Flat
        }),
    };

    let pending: Option<String> = row.try_get("pending")?;
    let pending = match pending.as_deref() {
        None => Pending::None,
        Some(raw) => Pending::parse(raw).unwrap_or_else(|| {
            warn!(value = raw, "Unknown stored pending state, defaulting to none");
            Pending::None
        }),
    };

    let breakout_up: Option<i64> = row.try_get("breakout_up")?;
    let breakout_dn: Option<i64> = row.try_get("breakout_dn")?;

    let state = StrategyState {
        position,
        pending,
        entry_price: row.try_get("entry_price")?,
        breakout_level: row.try_get("breakout_level")?,
        breakout_up: breakout_up.unwrap_or(0) != 0,
        breakout_dn: breakout_dn.unwrap_or(0) != 0,
        last_close_price: row.try_get("last_close_price")?,
    };
    if !state.is_consistent() {
        warn!(?state, "Stored strategy state violates invariants, normalizing");
    }
    Ok(state.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64, is_closed: bool) -> Bar {
        Bar {
            open_time,
            close_time: open_time + 899_999,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 3.5,
            is_closed,
        }
    }

    #[tokio::test]
    async fn empty_store_has_no_state() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_latest_strategy_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_state_round_trips_exactly() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = StrategyState {
            breakout_up: true,
            pending: Pending::WaitingShortEntry,
            breakout_level: Some(104.25),
            last_close_price: Some(106.0),
            ..StrategyState::default()
        };
        let second = StrategyState {
            position: Position::Short,
            pending: Pending::WaitingLongConfirm,
            entry_price: Some(103.5),
            breakout_level: Some(96.125),
            breakout_up: false,
            breakout_dn: true,
            last_close_price: Some(95.75),
        };
        // Same timestamp: insertion order decides.
        store.save_strategy_state(1_000, &first).await.unwrap();
        store.save_strategy_state(1_000, &second).await.unwrap();

        let loaded = store.load_latest_strategy_state().await.unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn legacy_rows_load_with_explicit_defaults() {
        let store = SqliteStore::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO strategy_state (ts, position, pending, entry_price, breakout_up, breakout_dn) \
             VALUES (1, 'flat', 'waiting_short', 101.0, NULL, NULL)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let loaded = store.load_latest_strategy_state().await.unwrap().unwrap();
        assert_eq!(loaded, StrategyState::default());
    }

    #[tokio::test]
    async fn bars_upsert_by_open_time() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert_or_replace_bar(&bar(0, 100.0, false)).await.unwrap();
        store.insert_or_replace_bar(&bar(0, 101.0, true)).await.unwrap();
        store.insert_or_replace_bar(&bar(900_000, 102.0, false)).await.unwrap();

        let bars = store.recent_bars(10).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0], bar(0, 101.0, true));
        assert_eq!(bars[1].open_time, 900_000);

        let last_one = store.recent_bars(1).await.unwrap();
        assert_eq!(last_one.len(), 1);
        assert_eq!(last_one[0].open_time, 900_000);
    }

    #[tokio::test]
    async fn closing_trade_marks_latest_matching_open_over() {
        let store = SqliteStore::in_memory().await.unwrap();
        let trade = |ts: i64, side: TradeSide| TradeRecord {
            ts,
            side,
            qty: 1.0,
            price: Some(100.0),
            order_id: Some(format!("o{ts}")),
            status: Some("FILLED".into()),
        };
        store.log_trade(&trade(1, TradeSide::Buy)).await.unwrap();
        store.log_trade(&trade(2, TradeSide::Sell)).await.unwrap();
        store.log_trade(&trade(3, TradeSide::BuyOpen)).await.unwrap();
        store.log_trade(&trade(4, TradeSide::SellClose)).await.unwrap();

        store.mark_open_trade_over(TradeSide::SellClose).await.unwrap();

        let rows = store.recent_trades(10).await.unwrap();
        let status_of = |ts: i64| rows.iter().find(|r| r.ts == ts).and_then(|r| r.status.clone());
        assert_eq!(status_of(3).as_deref(), Some("OVER"));
        assert_eq!(status_of(1).as_deref(), Some("FILLED"));
        assert_eq!(status_of(2).as_deref(), Some("FILLED"));

        // Non-closing sides are ignored.
        store.mark_open_trade_over(TradeSide::Buy).await.unwrap();
    }

    #[tokio::test]
    async fn observability_sinks_are_readable() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.log_signal(5, Signal::OpenShort, 103.5).await.unwrap();
        store.log_error(6, "order", "insufficient margin").await.unwrap();
        store
            .upsert_indicator(0, &Bands { ma: 100.0, std: 1.0, up: 102.0, dn: 98.0 })
            .await
            .unwrap();

        let signals = store.recent_signals(10).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal, "open_short");

        let errors = store.recent_errors(10).await.unwrap();
        assert_eq!(errors[0].origin, "order");
    }
}
