pub mod config;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod live;
pub mod store;
pub mod types;

pub use config::{Config, ExecutionParams, PositionSync, RestSettings, StreamSettings};
pub use error::{Error, Result};
pub use exchange::ExchangeClient;
pub use handler::BarHandler;
pub use live::{LiveCell, LiveSnapshot};
pub use store::StateStore;
pub use types::*;
