use proptest::prelude::*;

use common::{Bar, Position, Signal, StrategyState};
use strategy::{BandTick, BollingerBands, BreakoutRetest, StrategyParams};

fn tick_strategy() -> impl Strategy<Value = BandTick> {
    (
        90.0f64..110.0,
        0.0f64..4.0,
        0.0f64..4.0,
        95.0f64..105.0,
        0.5f64..8.0,
        any::<bool>(),
    )
        .prop_map(|(close, up_wick, down_wick, mid, half_width, is_closed)| BandTick {
            close,
            high: close + up_wick,
            low: close - down_wick,
            up: mid + half_width,
            dn: mid - half_width,
            is_closed,
        })
}

proptest! {
    /// Arbitrary tick sequences never break the state invariants.
    #[test]
    fn state_invariants_hold(
        ticks in prop::collection::vec(tick_strategy(), 1..200),
        only_on_close in any::<bool>(),
    ) {
        let params = StrategyParams { only_on_close, ..StrategyParams::default() };
        let mut sm = BreakoutRetest::new(params, StrategyState::default());
        for tick in &ticks {
            let signal = sm.on_tick(tick);
            let state = sm.state();
            prop_assert!(state.is_consistent(), "inconsistent state {:?}", state);
            if let Some(sig) = signal {
                prop_assert_eq!(state.position, sig.target());
                if state.position != Position::Flat {
                    prop_assert_eq!(state.entry_price, Some(tick.close));
                }
            }
        }
    }

    /// A short position always stops out when price closes above the band,
    /// whatever pending or breakout state it carries.
    #[test]
    fn stop_loss_short_takes_precedence(
        warmup in prop::collection::vec(tick_strategy(), 0..50),
        tick in tick_strategy(),
        excess in 0.01f64..10.0,
    ) {
        let mut sm = BreakoutRetest::new(StrategyParams::default(), StrategyState::default());
        for t in &warmup {
            sm.on_tick(t);
        }
        {
            let s = sm.state_mut();
            s.position = Position::Short;
            s.entry_price = Some(100.0);
        }
        let stop = BandTick { close: tick.up + excess, high: tick.up + excess, ..tick };
        prop_assert_eq!(sm.on_tick(&stop), Some(Signal::StopLossShort));
        prop_assert_eq!(sm.state().position, Position::Flat);
        prop_assert_eq!(sm.state().entry_price, None);
    }

    /// The window always retains exactly the most recent `max_rows` distinct
    /// open times, in ascending order.
    #[test]
    fn window_keeps_most_recent_rows(
        slots in prop::collection::vec((0i64..400, any::<bool>()), 1..300),
        max_rows in 20usize..60,
    ) {
        let mut bb = BollingerBands::new(20, 2.0, 0, max_rows);
        let mut seen = std::collections::BTreeSet::new();
        for (slot, is_closed) in slots {
            let open_time = slot * 60_000;
            bb.add_bar(Bar {
                open_time,
                close_time: open_time + 59_999,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + slot as f64 * 0.01,
                volume: 1.0,
                is_closed,
            }).unwrap();
            seen.insert(open_time);
        }
        let kept: Vec<i64> = bb.bars().map(|b| b.open_time).collect();
        let mut expected: Vec<i64> = seen.iter().rev().take(max_rows).copied().collect();
        expected.reverse();
        prop_assert_eq!(kept, expected);
    }
}
