//! Typed error hierarchy for issue-enhancer.
//!
//! Three top-level enums cover the subsystems whose failures callers match on:
//! - `PipelineError`: enhancement stage failures, tagged with the stage
//! - `DiscoveryError`: repository discovery failures (cloneable, shared with
//!   every single-flight waiter)
//! - `SyncError`: orchestrator-level failures that are not a connector's own
//!
//! Connector failures live in `enhancer_common::ConnectorError`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The ordered stages of an enhancement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ContextResearch,
    CodeResearch,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextResearch => "context research",
            Self::CodeResearch => "code research",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from an enhancement run. Every variant names the stage that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed: {source:#}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} timed out after {}s", timeout.as_secs())]
    StageTimeout { stage: Stage, timeout: Duration },

    #[error("{stage} produced no usable output: {reason}")]
    EmptyOutput { stage: Stage, reason: String },
}

impl PipelineError {
    pub fn failed(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self::StageFailed {
            stage,
            source: source.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::StageFailed { stage, .. }
            | Self::StageTimeout { stage, .. }
            | Self::EmptyOutput { stage, .. } => *stage,
        }
    }
}

/// Errors from repository discovery.
///
/// Cloneable because a single in-flight lookup hands the same result to every
/// waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Discovery upstream failed: {0}")]
    Upstream(String),

    #[error("No repository matches '{0}'")]
    NoMatch(String),

    #[error("Discovery lookup was abandoned before completing")]
    Abandoned,
}

/// Orchestrator-level sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unknown connector '{0}'")]
    UnknownConnector(String),

    #[error("No enabled connectors match filter: {0}")]
    NothingToSync(String),

    #[error("Sync state store error: {0:#}")]
    State(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_reports_its_stage() {
        let err = PipelineError::failed(Stage::CodeResearch, anyhow::anyhow!("clone failed"));
        assert_eq!(err.stage(), Stage::CodeResearch);
        assert!(err.to_string().contains("code research"));
        assert!(err.to_string().contains("clone failed"));
    }

    #[test]
    fn stage_timeout_carries_duration() {
        let err = PipelineError::StageTimeout {
            stage: Stage::Synthesis,
            timeout: Duration::from_secs(90),
        };
        assert_eq!(err.stage(), Stage::Synthesis);
        assert!(err.to_string().contains("90s"));
    }

    #[test]
    fn discovery_error_is_cloneable_and_comparable() {
        let err = DiscoveryError::Upstream("rate limited".into());
        assert_eq!(err.clone(), err);
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::EmptyOutput {
            stage: Stage::Synthesis,
            reason: "blank".into(),
        });
        assert_std_error(&DiscoveryError::Abandoned);
        assert_std_error(&SyncError::UnknownConnector("fax".into()));
    }
}
