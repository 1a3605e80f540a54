pub mod bollinger;

pub use bollinger::{mean_std, BollingerBands, IndicatorError};
