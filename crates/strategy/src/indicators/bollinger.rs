use std::collections::VecDeque;

use thiserror::Error;

use common::{Bands, Bar};

/// Input rejected by the band calculator. The window is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("bar opened at {open_time} carries non-finite prices")]
    NonFinite { open_time: i64 },
}

/// Bollinger Bands over a bounded, `open_time`-ordered window of bars.
///
/// Two statistics are derived from the same history:
/// - the canonical band from the last `window` closed bars, which is what the
///   exchange charts show for a finished bar;
/// - the realtime band, which swaps the newest close for the forming bar's
///   current price.
///
/// `ddof` selects population (0) or sample (1) standard deviation and must
/// match the exchange's convention, otherwise the bands drift.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    window: usize,
    multiplier: f64,
    ddof: usize,
    max_rows: usize,
    bars: VecDeque<Bar>,
}

impl BollingerBands {
    pub fn new(window: usize, multiplier: f64, ddof: usize, max_rows: usize) -> Self {
        assert!(window >= 2, "Bollinger window must be >= 2");
        assert!(ddof < window, "ddof must be smaller than the window");
        assert!(max_rows >= window, "max_rows must hold at least one window");
        Self {
            window,
            multiplier,
            ddof,
            max_rows,
            bars: VecDeque::with_capacity(max_rows + 1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Rows currently held, closed and forming.
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closed_len(&self) -> usize {
        self.bars.iter().filter(|b| b.is_closed).count()
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    /// Insert or overwrite `bar` (keyed by `open_time`), evict the oldest
    /// rows beyond `max_rows`, and return the canonical band.
    ///
    /// Returns `Ok(None)` while fewer than `window` closed bars are held.
    pub fn add_bar(&mut self, bar: Bar) -> Result<Option<Bands>, IndicatorError> {
        if !bar.is_finite() {
            return Err(IndicatorError::NonFinite {
                open_time: bar.open_time,
            });
        }

        match self
            .bars
            .binary_search_by_key(&bar.open_time, |b| b.open_time)
        {
            Ok(idx) => self.bars[idx] = bar,
            Err(idx) => self.bars.insert(idx, bar),
        }
        while self.bars.len() > self.max_rows {
            self.bars.pop_front();
        }

        Ok(self.closed_bands())
    }

    /// Canonical band over the last `window` closed bars.
    pub fn closed_bands(&self) -> Option<Bands> {
        let closes = self.closed_closes();
        if closes.len() < self.window {
            return None;
        }
        self.bands(&closes[closes.len() - self.window..])
    }

    /// Band over the last `min(closed, window - 1)` closed closes followed by
    /// `current_close`. Does not touch the stored bars.
    ///
    /// Returns `None` for fewer than two points, and for a zero or NaN
    /// deviation: a flat series would give `up == dn` and flip breakout flags
    /// on every tick.
    pub fn realtime(&self, current_close: f64) -> Option<Bands> {
        self.realtime_over(self.closed_closes(), current_close)
    }

    /// Realtime band for `bar` itself. Its own row is left out of the closed
    /// history, so at bar close this equals the canonical band.
    pub fn realtime_for(&self, bar: &Bar) -> Option<Bands> {
        let closes = self
            .bars
            .iter()
            .filter(|b| b.is_closed && b.open_time != bar.open_time)
            .map(|b| b.close)
            .collect();
        self.realtime_over(closes, bar.close)
    }

    fn realtime_over(&self, closes: Vec<f64>, current_close: f64) -> Option<Bands> {
        let take = closes.len().min(self.window - 1);

        let mut series = Vec::with_capacity(take + 1);
        series.extend_from_slice(&closes[closes.len() - take..]);
        series.push(current_close);
        if series.len() < 2 {
            return None;
        }

        let bands = self.bands(&series)?;
        if bands.std.is_nan() || bands.std == 0.0 {
            return None;
        }
        Some(bands)
    }

    fn closed_closes(&self) -> Vec<f64> {
        self.bars
            .iter()
            .filter(|b| b.is_closed)
            .map(|b| b.close)
            .collect()
    }

    fn bands(&self, closes: &[f64]) -> Option<Bands> {
        let (ma, std) = mean_std(closes, self.ddof)?;
        Some(Bands {
            ma,
            std,
            up: ma + self.multiplier * std,
            dn: ma - self.multiplier * std,
        })
    }
}

/// Mean and standard deviation with `ddof` delta degrees of freedom.
/// `None` when the series is too short for the requested `ddof`.
pub fn mean_std(values: &[f64], ddof: usize) -> Option<(f64, f64)> {
    let n = values.len();
    if n == 0 || n <= ddof {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((mean, (sum_sq / (n - ddof) as f64).sqrt()))
}
