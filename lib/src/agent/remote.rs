//! Agents on other machines. Messages are JSON documents in length-delimited frames over TCP.
//! The control plane keeps a small pool of idle connections per agent, every connection carries
//! one request at a time.
use crate::agent::{AgentError, ExecutionAgent, Reach};
use crate::execution::{ExecutionRequest, ExecutionResult};
use crate::harness::Harness;
use crate::protocol::session::SessionId;
use crate::target::CampaignTarget;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Extra time granted on top of the request timeout for the network round trip
const TRANSIT_ALLOWANCE: Duration = Duration::from_secs(2);
const MAX_IDLE_CONNECTIONS: usize = 16;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Execute {
        request: ExecutionRequest,
        timeout_ms: u64,
    },
    Probe,
    CloseSession {
        session: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    Result { result: ExecutionResult },
    Pong { agent: String },
    Closed,
    Error { message: String },
}

#[derive(Debug)]
pub struct RemoteAgent {
    id: String,
    address: String,
    reach: Reach,
    connect_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl RemoteAgent {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            reach: Reach::everywhere(),
            connect_timeout: Duration::from_secs(1),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reach(mut self, reach: Reach) -> Self {
        self.reach = reach;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn unreachable(&self, reason: impl ToString) -> AgentError {
        AgentError::Unreachable {
            agent: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    async fn connection(&self) -> Result<Connection, AgentError> {
        if let Some(connection) = self.idle.lock().unwrap().pop() {
            return Ok(connection);
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.unreachable("connect timed out"))?
            .map_err(|e| self.unreachable(e))?;
        stream.set_nodelay(true).map_err(|e| self.unreachable(e))?;
        debug!("Connected to agent {} at {}", self.id, self.address);
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }

    async fn call(&self, message: &AgentRequest, deadline: Duration) -> Result<AgentResponse, AgentError> {
        let mut connection = self.connection().await?;
        let bytes = serde_json::to_vec(message).map_err(|e| AgentError::InvalidMessage {
            agent: self.id.clone(),
            reason: e.to_string(),
        })?;
        connection
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| self.unreachable(e))?;
        let frame = tokio::time::timeout(deadline, connection.next())
            .await
            .map_err(|_| AgentError::Timeout(self.id.clone()))?
            .ok_or_else(|| self.unreachable("connection closed while waiting for response"))?
            .map_err(|e| self.unreachable(e))?;
        let response = serde_json::from_slice(&frame).map_err(|e| AgentError::InvalidMessage {
            agent: self.id.clone(),
            reason: e.to_string(),
        })?;
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
        Ok(response)
    }

    fn unexpected(&self, response: AgentResponse) -> AgentError {
        AgentError::InvalidMessage {
            agent: self.id.clone(),
            reason: format!("unexpected response {response:?}"),
        }
    }
}

#[async_trait]
impl ExecutionAgent for RemoteAgent {
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
        let message = AgentRequest::Execute {
            request: request.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.call(&message, timeout + TRANSIT_ALLOWANCE).await? {
            AgentResponse::Result { mut result } => {
                result.agent = Some(self.id.clone());
                Ok(result)
            }
            AgentResponse::Error { message } => Err(self.unreachable(message)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn probe(&self) -> Result<(), AgentError> {
        match self.call(&AgentRequest::Probe, self.connect_timeout).await? {
            AgentResponse::Pong { agent } => {
                trace!("Agent {} answered probe as {agent}", self.id);
                Ok(())
            }
            other => Err(self.unexpected(other)),
        }
    }

    async fn close_session(&self, session: SessionId) {
        let message = AgentRequest::CloseSession { session };
        if let Err(e) = self.call(&message, self.connect_timeout).await {
            debug!("Could not close session {session} on {}: {e}", self.id);
        }
    }
}

/// Serves the agent protocol on `listener` until `shutdown` is cancelled.
pub async fn serve_agent(
    listener: TcpListener,
    agent_id: String,
    harness: Arc<Harness>,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    info!("Agent {agent_id} listening on {}", listener.local_addr()?);
    serve_incoming(accepted_connections(listener), &agent_id, harness, shutdown).await;
    info!("Agent {agent_id} stopped");
    Ok(())
}

fn accepted_connections(listener: TcpListener) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>> {
    stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    })
}

/// Accept errors such as running out of file descriptors only cost the connection.
async fn serve_incoming<S>(incoming: S, agent_id: &str, harness: Arc<Harness>, shutdown: CancellationToken)
where
    S: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
{
    tokio::pin!(incoming);
    loop {
        let accepted = tokio::select! {
            accepted = incoming.next() => accepted,
            _ = shutdown.cancelled() => break,
        };
        let (stream, peer) = match accepted {
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                warn!("Agent {agent_id} could not accept a connection: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            None => break,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {peer}: {e}");
        }
        debug!("Control plane connected from {peer}");
        let harness = harness.clone();
        let agent_id = agent_id.to_string();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, &agent_id, &harness, shutdown).await {
                warn!("Connection from {peer} ended: {e}");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    agent_id: &str,
    harness: &Harness,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let response = match serde_json::from_slice::<AgentRequest>(&frame?) {
            Ok(AgentRequest::Execute {
                request,
                timeout_ms,
            }) => {
                let mut result = harness
                    .execute(&request, Duration::from_millis(timeout_ms))
                    .await;
                result.agent = Some(agent_id.to_string());
                AgentResponse::Result { result }
            }
            Ok(AgentRequest::Probe) => AgentResponse::Pong {
                agent: agent_id.to_string(),
            },
            Ok(AgentRequest::CloseSession { session }) => {
                harness.close_session(session);
                AgentResponse::Closed
            }
            Err(e) => AgentResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
    }
}
