use crate::alert::detector::FlashAlert;
use crate::engine::cycle::CycleReport;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

// ---------- Topic trait (broadcast semantics) ----------
#[async_trait]
pub trait Topic<T>: Sync + Send + 'static {
    async fn publish(&self, msg: T) -> Result<()>;

    /// Each subscriber has an independent cursor.
    fn subscribe(&self) -> broadcast::Receiver<Arc<T>>;
}

// ---------- Concrete broadcast topic ----------
// 1->N fanout, lossy under lag. Payloads are wrapped in Arc so reports are never deep-cloned.
pub struct BroadcastTopic<T: Send + Sync + 'static> {
    tx: broadcast::Sender<Arc<T>>,
}

impl<T: Send + Sync + 'static> BroadcastTopic<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(cap.max(1));
        Self { tx }
    }
}

#[async_trait]
impl<T: Debug + Send + Sync + 'static> Topic<T> for BroadcastTopic<T> {
    async fn publish(&self, msg: T) -> Result<()> {
        // Only fails when nobody is subscribed.
        let _ = self.tx.send(Arc::new(msg));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub struct Bus {
    pub cycle_reports: Arc<dyn Topic<CycleReport>>,
    pub alerts: Arc<dyn Topic<FlashAlert>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            cycle_reports: Arc::new(BroadcastTopic::<CycleReport>::with_capacity(TOPIC_CAPACITY)),
            alerts: Arc::new(BroadcastTopic::<FlashAlert>::with_capacity(TOPIC_CAPACITY)),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
