use crate::alert::detector::IndexSample;
use crate::confirmation::machine::ConfirmationCase;
use crate::core::types::{EntityId, EvidenceEvent};
use crate::scheduler::budget::{BudgetState, WindowLedger};
use crate::scoring::composite::CompositeScore;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything durable about one entity. Read at cycle start, written at cycle end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: EntityId,
    #[serde(default)]
    pub events: Vec<EvidenceEvent>,
    #[serde(default)]
    pub budget: Option<BudgetState>,
    /// Prior composite score, kept for delta observability only.
    #[serde(default)]
    pub last_score: Option<CompositeScore>,
    #[serde(default)]
    pub history: Vec<IndexSample>,
    #[serde(default)]
    pub confirmation: Option<ConfirmationCase>,
}

impl EntityRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            events: Vec::new(),
            budget: None,
            last_score: None,
            history: Vec::new(),
            confirmation: None,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn load_entity(&self, entity: &str) -> Result<Option<EntityRecord>>;
    async fn save_entity(&self, record: &EntityRecord) -> Result<()>;
    async fn load_window(&self) -> Result<Option<WindowLedger>>;
    async fn save_window(&self, ledger: &WindowLedger) -> Result<()>;
}

/// Process-local store. Records are kept serialized so a reload goes through serde.
#[derive(Default)]
pub struct MemoryRecordStore {
    entities: Mutex<HashMap<EntityId, String>>,
    window: Mutex<Option<String>>,
    offline: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("record store offline");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_entity(&self, entity: &str) -> Result<Option<EntityRecord>> {
        self.check_online()?;
        let raw = self.entities.lock().get(entity).cloned();
        raw.map(|s| serde_json::from_str(&s).context("decoding entity record"))
            .transpose()
    }

    async fn save_entity(&self, record: &EntityRecord) -> Result<()> {
        self.check_online()?;
        let raw = serde_json::to_string(record).context("encoding entity record")?;
        self.entities.lock().insert(record.entity.clone(), raw);
        Ok(())
    }

    async fn load_window(&self) -> Result<Option<WindowLedger>> {
        self.check_online()?;
        let raw = self.window.lock().clone();
        raw.map(|s| serde_json::from_str(&s).context("decoding window ledger"))
            .transpose()
    }

    async fn save_window(&self, ledger: &WindowLedger) -> Result<()> {
        self.check_online()?;
        *self.window.lock() = Some(serde_json::to_string(ledger)?);
        Ok(())
    }
}
