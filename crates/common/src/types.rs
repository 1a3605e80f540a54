use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds. Used for log/audit timestamps.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One kline (candlestick) for the subscribed instrument and interval.
///
/// Bars are keyed by `open_time`. The exchange re-sends the forming bar many
/// times with the same `open_time`; consumers must overwrite, not append.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, epoch ms.
    pub open_time: i64,
    /// Bar close time, epoch ms.
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True once the exchange has finalized the bar.
    pub is_closed: bool,
}

impl Bar {
    pub fn is_finite(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// A Bollinger Band snapshot. "Unavailable" is represented as `Option::None`
/// by every producer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bands {
    pub ma: f64,
    pub std: f64,
    pub up: f64,
    pub dn: f64,
}

/// Position currently held by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Flat,
    Long,
    Short,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Flat => "flat",
            Position::Long => "long",
            Position::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flat" => Some(Position::Flat),
            "long" => Some(Position::Long),
            "short" => Some(Position::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intermediate sub-state: a breakout happened and the strategy waits for
/// the retest before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Pending {
    #[default]
    None,
    WaitingShortEntry,
    WaitingLongEntry,
    WaitingShortConfirm,
    WaitingLongConfirm,
}

impl Pending {
    /// Storage form. `Pending::None` is stored as NULL.
    pub fn as_db(&self) -> Option<&'static str> {
        match self {
            Pending::None => None,
            Pending::WaitingShortEntry => Some("waiting_short_entry"),
            Pending::WaitingLongEntry => Some("waiting_long_entry"),
            Pending::WaitingShortConfirm => Some("waiting_short_confirm"),
            Pending::WaitingLongConfirm => Some("waiting_long_confirm"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Pending::None),
            "waiting_short_entry" => Some(Pending::WaitingShortEntry),
            "waiting_long_entry" => Some(Pending::WaitingLongEntry),
            "waiting_short_confirm" => Some(Pending::WaitingShortConfirm),
            "waiting_long_confirm" => Some(Pending::WaitingLongConfirm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db().unwrap_or("none"))
    }
}

/// The only mutable entity of the decision core.
///
/// Invariants:
/// - `position == Flat` implies `entry_price.is_none()`
/// - `breakout_up` and `breakout_dn` are never both set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct StrategyState {
    pub position: Position,
    pub pending: Pending,
    pub entry_price: Option<f64>,
    /// Band level recorded at breakout. Informational only.
    pub breakout_level: Option<f64>,
    pub breakout_up: bool,
    pub breakout_dn: bool,
    /// Close of the most recent closed bar.
    pub last_close_price: Option<f64>,
}

impl StrategyState {
    pub fn is_consistent(&self) -> bool {
        let flat_ok = self.position != Position::Flat || self.entry_price.is_none();
        flat_ok && !(self.breakout_up && self.breakout_dn)
    }

    /// Repair a snapshot that violates the invariants (e.g. a hand-edited or
    /// legacy row). Conflicting breakout flags are both dropped.
    pub fn normalized(mut self) -> Self {
        if self.position == Position::Flat {
            self.entry_price = None;
        }
        if self.breakout_up && self.breakout_dn {
            self.breakout_up = false;
            self.breakout_dn = false;
        }
        self
    }

    /// Adopt the position reported by the exchange, keeping the invariants.
    /// Returns true when the local state changed.
    pub fn adopt_position(&mut self, actual: Option<&ExchangePosition>) -> bool {
        let before = *self;
        match actual {
            None => {
                if self.position != Position::Flat {
                    self.position = Position::Flat;
                    self.entry_price = None;
                    self.breakout_level = None;
                    self.pending = Pending::None;
                }
            }
            Some(p) => {
                if self.position != p.position {
                    self.position = p.position;
                    self.pending = Pending::None;
                    self.entry_price = None;
                }
                if self.position != Position::Flat && self.entry_price.is_none() {
                    self.entry_price = Some(p.entry_price);
                }
            }
        }
        *self != before
    }
}

/// Decision emitted by the strategy, at most one per bar update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    OpenLong,
    OpenShort,
    StopLossLong,
    StopLossShort,
    CloseLongOpenShort,
    CloseShortOpenLong,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::OpenLong => "open_long",
            Signal::OpenShort => "open_short",
            Signal::StopLossLong => "stop_loss_long",
            Signal::StopLossShort => "stop_loss_short",
            Signal::CloseLongOpenShort => "close_long_open_short",
            Signal::CloseShortOpenLong => "close_short_open_long",
        }
    }

    /// Position the strategy holds after this signal.
    pub fn target(&self) -> Position {
        match self {
            Signal::OpenLong | Signal::CloseShortOpenLong => Position::Long,
            Signal::OpenShort | Signal::CloseLongOpenShort => Position::Short,
            Signal::StopLossLong | Signal::StopLossShort => Position::Flat,
        }
    }

    /// Trade side of the leg that closes the current position, if any.
    pub fn close_side(&self) -> Option<TradeSide> {
        match self {
            Signal::CloseShortOpenLong => Some(TradeSide::BuyClose),
            Signal::CloseLongOpenShort => Some(TradeSide::SellClose),
            Signal::StopLossShort => Some(TradeSide::BuyStopLoss),
            Signal::StopLossLong => Some(TradeSide::SellStopLoss),
            Signal::OpenLong | Signal::OpenShort => None,
        }
    }

    /// Trade side of the leg that opens a new position, if any.
    pub fn open_side(&self) -> Option<TradeSide> {
        match self {
            Signal::OpenLong => Some(TradeSide::Buy),
            Signal::OpenShort => Some(TradeSide::Sell),
            Signal::CloseShortOpenLong => Some(TradeSide::BuyOpen),
            Signal::CloseLongOpenShort => Some(TradeSide::SellOpen),
            Signal::StopLossLong | Signal::StopLossShort => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side labels written to the trade log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
    BuyOpen,
    SellOpen,
    BuyClose,
    SellClose,
    BuyStopLoss,
    SellStopLoss,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
            TradeSide::BuyOpen => "BUY_OPEN",
            TradeSide::SellOpen => "SELL_OPEN",
            TradeSide::BuyClose => "BUY_CLOSE",
            TradeSide::SellClose => "SELL_CLOSE",
            TradeSide::BuyStopLoss => "BUY_STOP_LOSS",
            TradeSide::SellStopLoss => "SELL_STOP_LOSS",
        }
    }

    /// Order side sent to the exchange.
    pub fn order_side(&self) -> &'static str {
        match self {
            TradeSide::Buy
            | TradeSide::BuyOpen
            | TradeSide::BuyClose
            | TradeSide::BuyStopLoss => "BUY",
            TradeSide::Sell
            | TradeSide::SellOpen
            | TradeSide::SellClose
            | TradeSide::SellStopLoss => "SELL",
        }
    }

    /// For a closing side, the opening sides whose latest trade it closes.
    /// A sell-to-close ends a long, a buy-to-close ends a short.
    pub fn closes(&self) -> Option<[TradeSide; 2]> {
        match self {
            TradeSide::SellClose | TradeSide::SellStopLoss => {
                Some([TradeSide::Buy, TradeSide::BuyOpen])
            }
            TradeSide::BuyClose | TradeSide::BuyStopLoss => {
                Some([TradeSide::Sell, TradeSide::SellOpen])
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the trade log, as returned by an execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: i64,
    pub side: TradeSide,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_id: Option<String>,
    pub status: Option<String>,
}

/// Position as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub position: Position,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Whether the bot is running against the real exchange or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clears_entry_price_when_flat() {
        let state = StrategyState {
            entry_price: Some(101.0),
            ..StrategyState::default()
        };
        assert!(!state.is_consistent());
        let fixed = state.normalized();
        assert!(fixed.is_consistent());
        assert_eq!(fixed.entry_price, None);
    }

    #[test]
    fn normalized_drops_conflicting_breakout_flags() {
        let state = StrategyState {
            breakout_up: true,
            breakout_dn: true,
            ..StrategyState::default()
        };
        let fixed = state.normalized();
        assert!(!fixed.breakout_up && !fixed.breakout_dn);
    }

    #[test]
    fn adopt_flat_exchange_position_clears_entry() {
        let mut state = StrategyState {
            position: Position::Short,
            pending: Pending::WaitingLongConfirm,
            entry_price: Some(100.0),
            breakout_level: Some(95.0),
            ..StrategyState::default()
        };
        assert!(state.adopt_position(None));
        assert_eq!(state.position, Position::Flat);
        assert_eq!(state.pending, Pending::None);
        assert!(state.is_consistent());
    }

    #[test]
    fn adopt_position_takes_exchange_entry_when_missing() {
        let mut state = StrategyState::default();
        let actual = ExchangePosition {
            position: Position::Long,
            quantity: 0.5,
            entry_price: 99.5,
        };
        assert!(state.adopt_position(Some(&actual)));
        assert_eq!(state.position, Position::Long);
        assert_eq!(state.entry_price, Some(99.5));
        // Same position again is a no-op.
        assert!(!state.adopt_position(Some(&actual)));
    }

    #[test]
    fn closing_sides_map_to_opposite_opening_sides() {
        assert_eq!(
            TradeSide::SellStopLoss.closes(),
            Some([TradeSide::Buy, TradeSide::BuyOpen])
        );
        assert_eq!(
            TradeSide::BuyClose.closes(),
            Some([TradeSide::Sell, TradeSide::SellOpen])
        );
        assert_eq!(TradeSide::BuyOpen.closes(), None);
    }

    #[test]
    fn reversal_signals_have_both_legs() {
        assert_eq!(Signal::CloseLongOpenShort.close_side(), Some(TradeSide::SellClose));
        assert_eq!(Signal::CloseLongOpenShort.open_side(), Some(TradeSide::SellOpen));
        assert_eq!(Signal::StopLossShort.open_side(), None);
        assert_eq!(Signal::OpenLong.close_side(), None);
        assert_eq!(TradeSide::BuyStopLoss.order_side(), "BUY");
        assert_eq!(TradeSide::SellOpen.order_side(), "SELL");
    }

    #[test]
    fn pending_none_is_stored_as_null() {
        assert_eq!(Pending::None.as_db(), None);
        assert_eq!(
            Pending::parse("waiting_long_confirm"),
            Some(Pending::WaitingLongConfirm)
        );
        assert_eq!(Pending::parse("waiting_short"), None);
    }
}
