//! Interfaces to the systems around the engine: the payload generator, the defense correlator,
//! the judge and whoever wants feedback about executed requests. None of them are implemented
//! here except the built-in mutation generator in [`crate::markov`].
use crate::execution::ExecutionResult;
use crate::protocol::Params;
use crate::target::CampaignTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    /// Protocol parameter overrides for this payload
    pub params: Params,
}

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// What the campaign knows about a target when it asks for the next payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorContext<'a> {
    pub campaign_id: &'a str,
    /// Payloads already issued for this target
    pub issued: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("generator failed: {0}")]
    Failed(String),
    #[error("generator did not answer within {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait PayloadGenerator: Send + Sync + Debug {
    /// `Ok(None)` once the generator has nothing more for this target.
    async fn next_payload(
        &self,
        target: &CampaignTarget,
        ctx: GeneratorContext<'_>,
    ) -> Result<Option<Payload>, GeneratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefenseSignal {
    /// Name of the defense system that reacted
    pub source: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Monitor,
    Investigate,
    Block,
    Escalate,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Monitor => write!(f, "monitor"),
            Verdict::Investigate => write!(f, "investigate"),
            Verdict::Block => write!(f, "block"),
            Verdict::Escalate => write!(f, "escalate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub verdict: Verdict,
    /// 0.0 ..= 1.0
    pub score: f64,
}

impl Judgment {
    pub fn new(verdict: Verdict, score: f64) -> Self {
        Self {
            verdict,
            score: score.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
pub trait DefenseCorrelator: Send + Sync + Debug {
    async fn correlate(&self, result: &ExecutionResult) -> Option<DefenseSignal>;
}

#[async_trait]
pub trait Judge: Send + Sync + Debug {
    async fn judge(&self, result: &ExecutionResult, defense: Option<&DefenseSignal>) -> Judgment;
}

#[async_trait]
pub trait FeedbackSink: Send + Sync + Debug {
    async fn feedback(&self, target: &CampaignTarget, payload: &[u8], result: &ExecutionResult);
}
