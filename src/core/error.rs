use crate::core::types::{EntityId, MetricKind};
use crate::scheduler::budget::DenyReason;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a telemetry adapter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("provider denied request: {0}")]
    Denied(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Entity-scoped failures. Always recovered locally: the entity proceeds with
/// neutral sub-scores and the cycle continues.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum EntityFault {
    #[error("source unavailable: {reason}")]
    SourceUnavailable { reason: String },
    #[error("admission denied: {0}")]
    Denied(DenyReason),
    #[error("snapshot missing requested {metric:?} data")]
    MalformedSnapshot { metric: MetricKind },
}

impl From<SourceError> for EntityFault {
    fn from(e: SourceError) -> Self {
        EntityFault::SourceUnavailable {
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub entity: EntityId,
    pub fault: EntityFault,
}

/// The only failures that escape entity scope.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CycleError {
    #[error("regime gate failure: {0}")]
    RegimeGateFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_become_unavailable_faults() {
        let fault: EntityFault = SourceError::Timeout(Duration::from_secs(2)).into();
        match fault {
            EntityFault::SourceUnavailable { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected fault {other:?}"),
        }
    }
}
