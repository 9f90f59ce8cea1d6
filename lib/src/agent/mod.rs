//! Execution agents: the things the scheduler hands requests to.
//! A [`LocalAgent`] runs the harness in-process, a [`remote::RemoteAgent`] forwards requests to
//! `serve_agent` on another machine.
pub mod remote;

use crate::execution::{ExecutionRequest, ExecutionResult};
use crate::harness::Harness;
use crate::protocol::session::SessionId;
use crate::target::CampaignTarget;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures of the agent itself. What happens to the target is part of the result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent {agent} is unreachable: {reason}")]
    Unreachable { agent: String, reason: String },
    #[error("agent {0} did not answer in time")]
    Timeout(String),
    #[error("agent {agent} sent an invalid message: {reason}")]
    InvalidMessage { agent: String, reason: String },
}

#[async_trait]
pub trait ExecutionAgent: Send + Sync + Debug {
    fn id(&self) -> &str;

    /// Whether the agent has network access to the target.
    fn can_reach(&self, target: &CampaignTarget) -> bool;

    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, AgentError>;

    /// Cheap liveness check used to bring unhealthy agents back.
    async fn probe(&self) -> Result<(), AgentError>;

    /// Drop whatever the agent keeps for the session.
    async fn close_session(&self, session: SessionId);
}

/// Hosts an agent may talk to. An empty list means every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reach {
    hosts: Vec<String>,
}

impl Reach {
    pub fn everywhere() -> Self {
        Self::default()
    }

    pub fn hosts(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, target: &CampaignTarget) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| *h == target.endpoint.host)
    }
}

#[derive(Debug, Clone)]
pub struct LocalAgent {
    id: String,
    harness: Arc<Harness>,
    reach: Reach,
}

impl LocalAgent {
    pub fn new(id: impl Into<String>, harness: Arc<Harness>) -> Self {
        Self {
            id: id.into(),
            harness,
            reach: Reach::everywhere(),
        }
    }

    pub fn with_reach(mut self, reach: Reach) -> Self {
        self.reach = reach;
        self
    }

    pub fn harness(&self) -> &Arc<Harness> {
        &self.harness
    }
}

#[async_trait]
impl ExecutionAgent for LocalAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_reach(&self, target: &CampaignTarget) -> bool {
        self.reach.allows(target)
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, AgentError> {
        let mut result = self.harness.execute(request, timeout).await;
        result.agent = Some(self.id.clone());
        Ok(result)
    }

    async fn probe(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn close_session(&self, session: SessionId) {
        self.harness.close_session(session);
    }
}
