pub mod binance;
pub mod executor;
pub mod pipeline;

pub use binance::{FuturesClient, KlineStream};
pub use executor::SignalExecutor;
pub use pipeline::Pipeline;
