//! Per-consumer high-water mark over event ids.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::history::{ProcessLog, ProcessRecord};

/// Watermark of a consumer that has processed nothing.
pub const UNSEEN: i64 = -1;

#[derive(Clone)]
pub struct WatermarkTracker {
    log: Arc<dyn ProcessLog>,
}

impl WatermarkTracker {
    pub fn new(log: Arc<dyn ProcessLog>) -> Self {
        Self { log }
    }

    pub async fn get_watermark(&self, consumer_id: &str) -> Result<i64> {
        Ok(self.log.watermark(consumer_id).await?.unwrap_or(UNSEEN))
    }

    /// Ratchet: values at or below the current mark are ignored.
    pub async fn advance(&self, consumer_id: &str, event_id: i64) -> Result<()> {
        let current = self.get_watermark(consumer_id).await?;
        if event_id <= current {
            debug!(consumer_id, event_id, current, "watermark already at or past event");
            return Ok(());
        }
        let stored = self.log.raise_watermark(consumer_id, event_id).await?;
        info!(consumer_id, from = current, to = stored, "watermark advanced");
        Ok(())
    }

    pub async fn record(&self, record: &ProcessRecord) -> Result<()> {
        self.log.record(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryProcessLog;

    #[tokio::test]
    async fn unknown_consumer_is_unseen() {
        let tracker = WatermarkTracker::new(Arc::new(MemoryProcessLog::new()));
        assert_eq!(tracker.get_watermark("glue").await.unwrap(), UNSEEN);
    }

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let tracker = WatermarkTracker::new(Arc::new(MemoryProcessLog::new()));
        tracker.advance("glue", 5).await.unwrap();
        tracker.advance("glue", 3).await.unwrap();
        assert_eq!(tracker.get_watermark("glue").await.unwrap(), 5);
        tracker.advance("glue", 5).await.unwrap();
        tracker.advance("glue", 6).await.unwrap();
        assert_eq!(tracker.get_watermark("glue").await.unwrap(), 6);
        assert_eq!(tracker.get_watermark("other").await.unwrap(), UNSEEN);
    }
}
