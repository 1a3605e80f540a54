use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use common::{
    now_ms, Bar, BarHandler, Error, LiveCell, LiveSnapshot, PositionSync, Result, Signal,
    StateStore, StrategyState, TradingMode,
};
use strategy::{BandSource, BandTick, BollingerBands, BreakoutRetest, StrategyFileConfig};

use crate::executor::SignalExecutor;

/// Extra closed bars loaded on startup beyond one window.
const BACKFILL_EXTRA: usize = 50;

/// Per-bar processing: persistence, band computation, decisioning and
/// execution, run in stream order by the kline stream.
pub struct Pipeline {
    bands: BollingerBands,
    strategy: BreakoutRetest,
    source: BandSource,
    store: Arc<dyn StateStore>,
    executor: SignalExecutor,
    live: LiveCell,
    sync: PositionSync,
}

impl Pipeline {
    pub fn new(
        config: &StrategyFileConfig,
        state: StrategyState,
        store: Arc<dyn StateStore>,
        executor: SignalExecutor,
        live: LiveCell,
        sync: PositionSync,
    ) -> Self {
        // Only a real exchange has a position worth syncing with.
        let sync = match executor.mode() {
            TradingMode::Live => sync,
            TradingMode::Paper => PositionSync::Off,
        };
        Self {
            bands: config.bands.build(),
            strategy: BreakoutRetest::new(config.strategy, state),
            source: config.bands.source,
            store,
            executor,
            live,
            sync,
        }
    }

    /// Build a pipeline from persisted state: the latest strategy snapshot
    /// and enough stored bars to make the bands available immediately.
    pub async fn restore(
        config: &StrategyFileConfig,
        store: Arc<dyn StateStore>,
        executor: SignalExecutor,
        live: LiveCell,
        sync: PositionSync,
    ) -> Result<Self> {
        let state = match store.load_latest_strategy_state().await? {
            Some(state) => {
                info!(
                    position = %state.position,
                    pending = %state.pending,
                    entry_price = ?state.entry_price,
                    "Restored strategy state"
                );
                state
            }
            None => {
                info!("No saved strategy state, starting flat");
                StrategyState::default()
            }
        };

        let mut pipeline = Self::new(config, state, store, executor, live, sync);
        pipeline.backfill().await?;
        Ok(pipeline)
    }

    async fn backfill(&mut self) -> Result<()> {
        let limit = (self.bands.window() + BACKFILL_EXTRA) as i64;
        let bars = self.store.recent_bars(limit).await?;
        let mut snapshots = 0usize;
        for mut bar in bars {
            // Anything stored is history by now, even a bar last seen forming.
            bar.is_closed = true;
            match self.bands.add_bar(bar) {
                Ok(Some(bands)) => {
                    self.store.upsert_indicator(bar.open_time, &bands).await?;
                    snapshots += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping stored bar during backfill"),
            }
        }
        info!(
            rows = self.bands.len(),
            snapshots,
            available = self.bands.closed_bands().is_some(),
            "Backfilled band window"
        );
        Ok(())
    }

    pub fn state(&self) -> &StrategyState {
        self.strategy.state()
    }

    pub fn bands(&self) -> &BollingerBands {
        &self.bands
    }

    /// Reconcile local position with the exchange. Returns false when the
    /// decision for this bar must be skipped.
    async fn sync_position(&mut self) -> bool {
        if self.sync == PositionSync::Off {
            return true;
        }
        match self.executor.client().open_position().await {
            Ok(actual) => {
                let before = self.strategy.state().position;
                if self.strategy.state_mut().adopt_position(actual.as_ref()) {
                    info!(
                        from = %before,
                        to = %self.strategy.state().position,
                        "Adopted exchange position"
                    );
                }
                true
            }
            Err(e) if self.sync == PositionSync::Lenient => {
                warn!(error = %e, "Position query failed, keeping local state");
                true
            }
            Err(e) => {
                error!(error = %e, "Position query failed, skipping decision");
                if let Err(log_err) = self
                    .store
                    .log_error(now_ms(), "position_sync", &e.to_string())
                    .await
                {
                    warn!(error = %log_err, "Failed to record position sync error");
                }
                false
            }
        }
    }

    async fn decide(&mut self, bar: &Bar, tick: BandTick) -> Option<Signal> {
        if !self.sync_position().await {
            return None;
        }
        let signal = self.strategy.on_tick(&tick)?;

        info!(
            %signal,
            price = bar.close,
            up = tick.up,
            dn = tick.dn,
            "Signal"
        );
        if let Err(e) = self.store.log_signal(now_ms(), signal, bar.close).await {
            warn!(%signal, error = %e, "Failed to record signal");
        }
        Some(signal)
    }
}

#[async_trait]
impl BarHandler for Pipeline {
    async fn on_bar(&mut self, bar: Bar) -> Result<()> {
        if !bar.is_finite() {
            warn!(open_time = bar.open_time, "Dropping bar with non-finite prices");
            return Ok(());
        }

        self.store.insert_or_replace_bar(&bar).await?;
        let closed = self
            .bands
            .add_bar(bar)
            .map_err(|e| Error::Parse(e.to_string()))?;
        if bar.is_closed {
            if let Some(bands) = &closed {
                self.store.upsert_indicator(bar.open_time, bands).await?;
            }
        }

        let realtime = self.bands.realtime_for(&bar);
        self.live
            .publish(LiveSnapshot {
                bar,
                closed,
                realtime,
                updated_at: now_ms(),
            })
            .await;

        if self.bands.len() < self.bands.window() + 1 {
            debug!(
                rows = self.bands.len(),
                needed = self.bands.window() + 1,
                "Warming up"
            );
            return Ok(());
        }

        let selected = match self.source {
            BandSource::Closed => closed,
            BandSource::Realtime => realtime,
        };
        let signal = match selected {
            Some(bands) => self.decide(&bar, BandTick::new(&bar, &bands)).await,
            None => {
                debug!(source = ?self.source, "Band unavailable, skipping decision");
                None
            }
        };

        let ts = now_ms();
        if let Err(e) = self
            .store
            .save_strategy_state(ts, self.strategy.state())
            .await
        {
            error!(error = %e, "Failed to persist strategy state");
            if let Err(log_err) = self
                .store
                .log_error(ts, "save_strategy_state", &e.to_string())
                .await
            {
                warn!(error = %log_err, "Failed to record state persistence error");
            }
            return Err(e);
        }

        if let Some(signal) = signal {
            self.executor.dispatch(signal, bar.close).await;
        }
        Ok(())
    }
}
