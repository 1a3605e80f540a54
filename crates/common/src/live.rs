use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::{Bands, Bar};

/// Latest market view published by the bar pipeline for read-only consumers
/// such as the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub bar: Bar,
    /// Bands from closed bars only.
    pub closed: Option<Bands>,
    /// Bands including the forming bar's current price.
    pub realtime: Option<Bands>,
    /// Wall-clock time of the update, epoch ms.
    pub updated_at: i64,
}

/// Shared cell holding the latest `LiveSnapshot`. Written only by the
/// pipeline; every other holder just reads.
#[derive(Debug, Clone, Default)]
pub struct LiveCell {
    inner: Arc<RwLock<Option<LiveSnapshot>>>,
}

impl LiveCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, snapshot: LiveSnapshot) {
        *self.inner.write().await = Some(snapshot);
    }

    pub async fn latest(&self) -> Option<LiveSnapshot> {
        *self.inner.read().await
    }
}
