pub mod breakout;
pub mod config;
pub mod indicators;

pub use breakout::{BandTick, BreakoutRetest, StrategyParams};
pub use config::{BandConfig, BandSource, StrategyFileConfig};
pub use indicators::{BollingerBands, IndicatorError};
