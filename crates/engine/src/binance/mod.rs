pub mod rest;
pub mod stream;

pub use rest::FuturesClient;
pub use stream::{Backoff, KlineStream};
