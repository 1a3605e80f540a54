use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use common::{Bands, Bar, Pending, Position, Signal, StrategyState};

/// Tunables of the breakout/retest state machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StrategyParams {
    /// Defer entries and reversals to closed bars. Stop-loss is never deferred.
    pub only_on_close: bool,
    /// Accepted but not applied: entries are evaluated against the current
    /// band, not the level recorded at breakout.
    pub use_breakout_level_for_entry: bool,
    /// Accepted but not applied: no buffer is required when price returns
    /// inside the band.
    pub reentry_buffer_pct: f64,
}

/// One price/band observation fed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandTick {
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub up: f64,
    pub dn: f64,
    pub is_closed: bool,
}

impl BandTick {
    pub fn new(bar: &Bar, bands: &Bands) -> Self {
        Self {
            close: bar.close,
            high: bar.high,
            low: bar.low,
            up: bands.up,
            dn: bands.dn,
            is_closed: bar.is_closed,
        }
    }

    fn inside_band(&self) -> bool {
        self.dn <= self.close && self.close <= self.up
    }
}

/// Bollinger breakout/retest strategy for a single instrument.
///
/// A close or wick beyond a band arms a pending entry; the retest (price
/// back across the same band) opens the position fading the breakout. While
/// in a position, a breakout of the opposite band arms a reversal, and a
/// close beyond the band on the losing side stops the position out.
#[derive(Debug, Clone)]
pub struct BreakoutRetest {
    params: StrategyParams,
    state: StrategyState,
}

impl BreakoutRetest {
    pub fn new(params: StrategyParams, state: StrategyState) -> Self {
        if params.use_breakout_level_for_entry || params.reentry_buffer_pct != 0.0 {
            warn!(
                use_breakout_level_for_entry = params.use_breakout_level_for_entry,
                reentry_buffer_pct = params.reentry_buffer_pct,
                "Entry refinement parameters are accepted but not applied"
            );
        }
        Self { params, state }
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StrategyState {
        &mut self.state
    }

    /// Advance the state machine by one observation. Emits at most one signal.
    pub fn on_tick(&mut self, tick: &BandTick) -> Option<Signal> {
        self.update_breakout_flags(tick);

        let signal = match self.stop_loss(tick) {
            Some(stop) => Some(stop),
            None => self.entry_or_reversal(tick),
        };

        if tick.is_closed {
            if tick.inside_band() && self.state.pending == Pending::None {
                self.state.breakout_up = false;
                self.state.breakout_dn = false;
            }
            self.state.last_close_price = Some(tick.close);
        }

        signal
    }

    // Wicks count: a forming bar that pokes through a band arms the flag even
    // if the close retreats.
    fn update_breakout_flags(&mut self, tick: &BandTick) {
        let s = &mut self.state;
        if tick.close > tick.up || tick.high > tick.up {
            s.breakout_up = true;
            s.breakout_dn = false;
        } else if tick.close < tick.dn || tick.low < tick.dn {
            s.breakout_dn = true;
            s.breakout_up = false;
        }
    }

    fn stop_loss(&mut self, tick: &BandTick) -> Option<Signal> {
        let signal = match self.state.position {
            Position::Short if tick.close > tick.up => Signal::StopLossShort,
            Position::Long if tick.close < tick.dn => Signal::StopLossLong,
            _ => return None,
        };
        let s = &mut self.state;
        s.position = Position::Flat;
        s.entry_price = None;
        s.breakout_level = None;
        s.pending = Pending::None;
        Some(signal)
    }

    fn entry_or_reversal(&mut self, tick: &BandTick) -> Option<Signal> {
        let may_act = !self.params.only_on_close || tick.is_closed;
        let s = &mut self.state;

        match s.position {
            Position::Flat => {
                if s.breakout_up && s.pending != Pending::WaitingShortEntry {
                    arm(s, Pending::WaitingShortEntry, tick.up);
                } else if s.breakout_dn && s.pending != Pending::WaitingLongEntry {
                    arm(s, Pending::WaitingLongEntry, tick.dn);
                }
                if !may_act {
                    return None;
                }
                match s.pending {
                    Pending::WaitingShortEntry if tick.close < tick.up => {
                        s.position = Position::Short;
                        s.entry_price = Some(tick.close);
                        s.pending = Pending::None;
                        s.breakout_up = false;
                        Some(Signal::OpenShort)
                    }
                    Pending::WaitingLongEntry if tick.close > tick.dn => {
                        s.position = Position::Long;
                        s.entry_price = Some(tick.close);
                        s.pending = Pending::None;
                        s.breakout_dn = false;
                        Some(Signal::OpenLong)
                    }
                    _ => None,
                }
            }
            Position::Short => {
                if s.breakout_dn && s.pending != Pending::WaitingLongConfirm {
                    arm(s, Pending::WaitingLongConfirm, tick.dn);
                }
                if may_act && s.pending == Pending::WaitingLongConfirm && tick.close > tick.dn {
                    s.position = Position::Long;
                    s.entry_price = Some(tick.close);
                    s.pending = Pending::None;
                    s.breakout_dn = false;
                    return Some(Signal::CloseShortOpenLong);
                }
                None
            }
            Position::Long => {
                if s.breakout_up && s.pending != Pending::WaitingShortConfirm {
                    arm(s, Pending::WaitingShortConfirm, tick.up);
                }
                if may_act && s.pending == Pending::WaitingShortConfirm && tick.close < tick.up {
                    s.position = Position::Short;
                    s.entry_price = Some(tick.close);
                    s.pending = Pending::None;
                    s.breakout_up = false;
                    return Some(Signal::CloseLongOpenShort);
                }
                None
            }
        }
    }
}

fn arm(state: &mut StrategyState, pending: Pending, level: f64) {
    debug!(from = %state.pending, to = %pending, level, "Pending state armed");
    state.pending = pending;
    state.breakout_level = Some(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP: f64 = 104.0;
    const DN: f64 = 96.0;

    fn tick(close: f64, is_closed: bool) -> BandTick {
        BandTick {
            close,
            high: close,
            low: close,
            up: UP,
            dn: DN,
            is_closed,
        }
    }

    fn wick(close: f64, high: f64, low: f64) -> BandTick {
        BandTick {
            close,
            high,
            low,
            up: UP,
            dn: DN,
            is_closed: false,
        }
    }

    fn engine() -> BreakoutRetest {
        BreakoutRetest::new(StrategyParams::default(), StrategyState::default())
    }

    #[test]
    fn breakout_then_retest_opens_short() {
        let mut sm = engine();
        assert_eq!(sm.on_tick(&tick(106.0, true)), None);
        assert_eq!(sm.state().pending, Pending::WaitingShortEntry);
        assert_eq!(sm.state().breakout_level, Some(UP));
        assert!(sm.state().breakout_up);

        assert_eq!(sm.on_tick(&tick(103.5, true)), Some(Signal::OpenShort));
        let s = sm.state();
        assert_eq!(s.position, Position::Short);
        assert_eq!(s.entry_price, Some(103.5));
        assert_eq!(s.pending, Pending::None);
        assert!(!s.breakout_up);
        assert_eq!(s.last_close_price, Some(103.5));
    }

    #[test]
    fn breakdown_then_retest_opens_long() {
        let mut sm = engine();
        assert_eq!(sm.on_tick(&tick(94.0, false)), None);
        assert_eq!(sm.state().pending, Pending::WaitingLongEntry);
        assert_eq!(sm.on_tick(&tick(96.5, false)), Some(Signal::OpenLong));
        assert_eq!(sm.state().position, Position::Long);
        assert_eq!(sm.state().entry_price, Some(96.5));
    }

    #[test]
    fn wick_through_upper_band_counts_as_breakout() {
        let mut sm = engine();
        // High pierces the band, close retreats: armed and retested in one update.
        assert_eq!(sm.on_tick(&wick(103.0, 105.0, 102.0)), Some(Signal::OpenShort));
        assert_eq!(sm.state().position, Position::Short);
    }

    #[test]
    fn short_stops_out_on_close_above_band() {
        let mut sm = BreakoutRetest::new(
            StrategyParams::default(),
            StrategyState {
                position: Position::Short,
                pending: Pending::WaitingLongConfirm,
                entry_price: Some(100.0),
                breakout_level: Some(DN),
                breakout_dn: true,
                ..StrategyState::default()
            },
        );
        assert_eq!(sm.on_tick(&tick(105.0, false)), Some(Signal::StopLossShort));
        let s = sm.state();
        assert_eq!(s.position, Position::Flat);
        assert_eq!(s.entry_price, None);
        assert_eq!(s.breakout_level, None);
        assert_eq!(s.pending, Pending::None);
        assert!(s.is_consistent());
    }

    #[test]
    fn long_stops_out_on_close_below_band() {
        let mut sm = BreakoutRetest::new(
            StrategyParams::default(),
            StrategyState {
                position: Position::Long,
                entry_price: Some(100.0),
                ..StrategyState::default()
            },
        );
        assert_eq!(sm.on_tick(&tick(95.0, true)), Some(Signal::StopLossLong));
        assert_eq!(sm.state().position, Position::Flat);
    }

    #[test]
    fn stop_loss_ignores_only_on_close() {
        let params = StrategyParams {
            only_on_close: true,
            ..StrategyParams::default()
        };
        let mut sm = BreakoutRetest::new(
            params,
            StrategyState {
                position: Position::Short,
                entry_price: Some(100.0),
                ..StrategyState::default()
            },
        );
        assert_eq!(sm.on_tick(&tick(110.0, false)), Some(Signal::StopLossShort));
    }

    #[test]
    fn short_reverses_to_long_after_lower_band_retest() {
        let mut sm = BreakoutRetest::new(
            StrategyParams::default(),
            StrategyState {
                position: Position::Short,
                entry_price: Some(103.0),
                ..StrategyState::default()
            },
        );
        assert_eq!(sm.on_tick(&tick(95.0, true)), None);
        assert_eq!(sm.state().pending, Pending::WaitingLongConfirm);
        assert_eq!(sm.state().breakout_level, Some(DN));

        assert_eq!(sm.on_tick(&tick(97.0, true)), Some(Signal::CloseShortOpenLong));
        let s = sm.state();
        assert_eq!(s.position, Position::Long);
        assert_eq!(s.entry_price, Some(97.0));
        assert!(!s.breakout_dn);
    }

    #[test]
    fn long_reverses_to_short_after_upper_band_retest() {
        let mut sm = BreakoutRetest::new(
            StrategyParams::default(),
            StrategyState {
                position: Position::Long,
                entry_price: Some(97.0),
                ..StrategyState::default()
            },
        );
        assert_eq!(sm.on_tick(&wick(103.0, 104.5, 102.0)), Some(Signal::CloseLongOpenShort));
        assert_eq!(sm.state().position, Position::Short);
        assert_eq!(sm.state().entry_price, Some(103.0));
    }

    #[test]
    fn only_on_close_defers_entry_until_bar_closes() {
        let params = StrategyParams {
            only_on_close: true,
            ..StrategyParams::default()
        };
        let mut sm = BreakoutRetest::new(params, StrategyState::default());
        assert_eq!(sm.on_tick(&tick(106.0, false)), None);
        assert_eq!(sm.state().pending, Pending::WaitingShortEntry);
        // Retest while forming: pending stays armed, no entry.
        assert_eq!(sm.on_tick(&tick(103.0, false)), None);
        assert_eq!(sm.state().position, Position::Flat);
        // Bar closes back inside: entry fires.
        assert_eq!(sm.on_tick(&tick(103.0, true)), Some(Signal::OpenShort));
    }

    #[test]
    fn closed_bar_inside_band_clears_stale_breakout() {
        let mut sm = BreakoutRetest::new(
            StrategyParams::default(),
            StrategyState {
                position: Position::Long,
                entry_price: Some(99.0),
                breakout_dn: true,
                ..StrategyState::default()
            },
        );
        assert_eq!(sm.on_tick(&tick(100.0, true)), None);
        assert!(!sm.state().breakout_dn);
        assert_eq!(sm.state().last_close_price, Some(100.0));
    }

    #[test]
    fn forming_bar_does_not_touch_last_close() {
        let mut sm = engine();
        sm.on_tick(&tick(100.0, true));
        sm.on_tick(&tick(101.0, false));
        assert_eq!(sm.state().last_close_price, Some(100.0));
    }

    #[test]
    fn breakout_flags_are_exclusive() {
        let mut sm = engine();
        sm.on_tick(&tick(106.0, false));
        assert!(sm.state().breakout_up);
        sm.on_tick(&wick(100.0, 101.0, 95.0));
        assert!(sm.state().breakout_dn);
        assert!(!sm.state().breakout_up);
    }
}
