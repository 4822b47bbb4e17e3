use crate::core::error::SourceError;
use crate::core::types::{Entity, FetchSpec, RegimeSnapshot, TelemetrySnapshot};
use crate::source::client::TelemetrySource;
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Provider call ceiling plus a per-call timeout in front of any source.
pub struct ThrottledSource<S> {
    inner: S,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    timeout: Duration,
}

impl<S: TelemetrySource> ThrottledSource<S> {
    pub fn new(inner: S, rate_limit_per_minute: u32, timeout: Duration) -> Self {
        let rpm = NonZeroU32::new(rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
        Self {
            inner,
            limiter,
            timeout,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: TelemetrySource> TelemetrySource for ThrottledSource<S> {
    async fn fetch(
        &self,
        entity: &Entity,
        spec: &FetchSpec,
    ) -> Result<TelemetrySnapshot, SourceError> {
        self.limiter.until_ready().await;
        match tokio::time::timeout(self.timeout, self.inner.fetch(entity, spec)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(entity = %entity.id, timeout = ?self.timeout, "fetch timed out");
                Err(SourceError::Timeout(self.timeout))
            }
        }
    }

    async fn fetch_regime(&self) -> Result<RegimeSnapshot, SourceError> {
        self.limiter.until_ready().await;
        tokio::time::timeout(self.timeout, self.inner.fetch_regime())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))?
    }
}
