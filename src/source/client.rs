use crate::core::error::SourceError;
use crate::core::types::{Entity, FetchSpec, RegimeSnapshot, TelemetrySnapshot};
use async_trait::async_trait;

/// Provider-facing adapter. The engine only calls `fetch` with a grant in hand.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn fetch(
        &self,
        entity: &Entity,
        spec: &FetchSpec,
    ) -> Result<TelemetrySnapshot, SourceError>;

    async fn fetch_regime(&self) -> Result<RegimeSnapshot, SourceError>;
}
