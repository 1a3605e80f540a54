use async_trait::async_trait;

use crate::{Bar, Result};

/// Consumer of the bar stream. The stream client awaits each call before
/// reading the next message, so implementations see bars in arrival order
/// and never run concurrently with themselves.
#[async_trait]
pub trait BarHandler: Send {
    async fn on_bar(&mut self, bar: Bar) -> Result<()>;
}
