//! ## Scheduler
//! Spreads execution requests over the agent pool.
//!
//! * every agent has a fixed number of permits, a request holds one while it runs;
//!   when no eligible agent has a free permit [`Scheduler::submit`] waits
//! * requests go to the least loaded healthy agent that can reach the target
//! * requests of one session run through a lane: one task, one agent, submission order;
//!   a lane job takes its permit when it reaches the head of the lane, a full lane makes
//!   [`Scheduler::submit`] wait
//! * a failed agent is marked and the request is retried elsewhere, after `max_retries`
//!   retries the result is `agent_unreachable`
pub mod health;

use crate::agent::{AgentError, ExecutionAgent};
use crate::execution::{CoverageDelta, ExecutionRequest, ExecutionResult, Outcome};
use crate::protocol::session::SessionId;
use crate::protocol::ConfigurationError;
use crate::target::CampaignTarget;
use futures::future::select_all;
use health::{AgentHealth, HealthEvent, HealthTracker};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Agents get this much longer than the request timeout before the scheduler gives up on them
const AGENT_GRACE: Duration = Duration::from_secs(2);

/// Requests a session may have queued before [`Scheduler::submit`] waits
const LANE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub unhealthy_threshold: u32,
    pub probe_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(200),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            unhealthy_threshold: 3,
            probe_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct AgentSlot {
    agent: Arc<dyn ExecutionAgent>,
    concurrency: usize,
    permits: Arc<Semaphore>,
    health: Mutex<HealthTracker>,
    executed: AtomicU64,
    failures: AtomicU64,
}

impl AgentSlot {
    fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    fn is_eligible(&self) -> bool {
        self.health.lock().unwrap().is_eligible()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub id: String,
    pub health: AgentHealth,
    pub concurrency: usize,
    pub in_flight: usize,
    pub executed: u64,
    pub failures: u64,
}

type Acquired = (usize, OwnedSemaphorePermit);

#[derive(Debug)]
struct LaneJob {
    request: ExecutionRequest,
    reply: oneshot::Sender<ExecutionResult>,
}

#[derive(Debug)]
struct Lane {
    jobs: mpsc::Sender<LaneJob>,
    /// Agent the session is bound to
    pinned: Arc<Mutex<Option<usize>>>,
}

#[derive(Debug)]
struct SchedulerInner {
    agents: Vec<AgentSlot>,
    config: SchedulerConfig,
    lanes: Mutex<HashMap<SessionId, Lane>>,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Resolves to the result of a submitted request.
#[derive(Debug)]
pub struct PendingResult {
    request_id: u64,
    target: String,
    receiver: oneshot::Receiver<ExecutionResult>,
}

impl PendingResult {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for PendingResult {
    type Output = ExecutionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The dispatch task died without answering
            Poll::Ready(Err(_)) => Poll::Ready(ExecutionResult {
                request_id: self.request_id,
                target: self.target.clone(),
                outcome: Outcome::AgentUnreachable,
                signal: None,
                latency: Duration::ZERO,
                coverage: CoverageDelta::default(),
                excerpt: "dispatch aborted".to_string(),
                agent: None,
                attempts: 0,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Scheduler {
    /// `agents` pairs every agent with its concurrency limit.
    pub fn new(
        agents: Vec<(Arc<dyn ExecutionAgent>, usize)>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigurationError> {
        let mut ids = HashSet::new();
        let mut slots = Vec::with_capacity(agents.len());
        for (agent, concurrency) in agents {
            if concurrency == 0 {
                return Err(ConfigurationError::InvalidAgent(format!(
                    "agent {} has a concurrency of 0",
                    agent.id()
                )));
            }
            if !ids.insert(agent.id().to_string()) {
                return Err(ConfigurationError::InvalidAgent(format!(
                    "agent id {} is used twice",
                    agent.id()
                )));
            }
            slots.push(AgentSlot {
                agent,
                concurrency,
                permits: Arc::new(Semaphore::new(concurrency)),
                health: Mutex::new(HealthTracker::new(config.unhealthy_threshold)),
                executed: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            });
        }
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                agents: slots,
                config,
                lanes: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Whether any agent, healthy or not, can reach the target.
    pub fn has_route(&self, target: &CampaignTarget) -> bool {
        self.inner.agents.iter().any(|a| a.agent.can_reach(target))
    }

    /// Hands the request to an agent. Waits while every eligible agent is saturated, the
    /// returned future resolves once the request has a result.
    pub async fn submit(&self, request: ExecutionRequest) -> PendingResult {
        let (reply, receiver) = oneshot::channel();
        let pending = PendingResult {
            request_id: request.request_id,
            target: request.target.name.clone(),
            receiver,
        };
        match request.session {
            Some(session) => {
                let jobs = self.lane(session.id);
                trace!(
                    "Queued request {} on lane of session {}",
                    request.request_id,
                    session.id
                );
                // A full lane holds the submitter back until the session catches up
                if let Err(mpsc::error::SendError(job)) = jobs.send(LaneJob { request, reply }).await {
                    // Lane task is gone, run it on its own
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        let first = inner.acquire(&job.request.target, None, &[]).await;
                        let result = inner.dispatch(job.request, first, None).await;
                        let _ = job.reply.send(result);
                    });
                }
            }
            None => {
                let first = self.inner.acquire(&request.target, None, &[]).await;
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let result = inner.dispatch(request, first, None).await;
                    let _ = reply.send(result);
                });
            }
        }
        pending
    }

    fn lane(&self, session: SessionId) -> mpsc::Sender<LaneJob> {
        let mut lanes = self.inner.lanes.lock().unwrap();
        let lane = lanes.entry(session).or_insert_with(|| {
            let (jobs, mut queue) = mpsc::channel::<LaneJob>(LANE_DEPTH);
            let pinned = Arc::new(Mutex::new(None));
            let inner = self.inner.clone();
            let lane_pin = pinned.clone();
            tokio::spawn(async move {
                while let Some(job) = queue.recv().await {
                    // The permit is taken only once the job is at the head of the lane
                    let prefer = *lane_pin.lock().unwrap();
                    let first = inner.acquire(&job.request.target, prefer, &[]).await;
                    if let Some((idx, _)) = &first {
                        *lane_pin.lock().unwrap() = Some(*idx);
                    }
                    let result = inner.dispatch(job.request, first, Some(&lane_pin)).await;
                    let _ = job.reply.send(result);
                }
                trace!("Lane of session {session} finished");
            });
            debug!("Opened lane for session {session}");
            Lane { jobs, pinned }
        });
        lane.jobs.clone()
    }

    /// Closes the session's lane and tells its agent to forget the session.
    pub async fn release_session(&self, session: SessionId) {
        let lane = self.inner.lanes.lock().unwrap().remove(&session);
        let Some(lane) = lane else {
            return;
        };
        let pinned = *lane.pinned.lock().unwrap();
        drop(lane);
        if let Some(idx) = pinned {
            self.inner.agents[idx].agent.close_session(session).await;
        }
    }

    pub fn active_lanes(&self) -> usize {
        self.inner.lanes.lock().unwrap().len()
    }

    /// Agent the session is bound to, if any.
    pub fn session_agent(&self, session: SessionId) -> Option<String> {
        let lanes = self.inner.lanes.lock().unwrap();
        let idx = (*lanes.get(&session)?.pinned.lock().unwrap())?;
        Some(self.inner.agents[idx].agent.id().to_string())
    }

    pub fn agent_status(&self) -> Vec<AgentStatus> {
        self.inner
            .agents
            .iter()
            .map(|slot| AgentStatus {
                id: slot.agent.id().to_string(),
                health: slot.health.lock().unwrap().status(),
                concurrency: slot.concurrency,
                in_flight: slot.in_flight(),
                executed: slot.executed.load(Ordering::Relaxed),
                failures: slot.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Probes unhealthy agents every `probe_interval` until `shutdown` is cancelled.
    pub fn spawn_health_prober(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.probe_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                for idx in 0..inner.agents.len() {
                    if !inner.agents[idx].is_eligible() {
                        inner.probe(idx).await;
                    }
                }
            }
        })
    }
}

impl SchedulerInner {
    fn update_health(&self, idx: usize, event: HealthEvent) {
        let slot = &self.agents[idx];
        let transition = slot.health.lock().unwrap().apply(event);
        if let Some(t) = transition {
            match t.to {
                AgentHealth::Healthy => info!("Agent {} is healthy again", slot.agent.id()),
                AgentHealth::Suspect => warn!("Agent {} is suspect", slot.agent.id()),
                AgentHealth::Unhealthy => warn!(
                    "Agent {} is unhealthy after {} consecutive failures",
                    slot.agent.id(),
                    t.consecutive_failures
                ),
            }
        }
    }

    async fn probe(&self, idx: usize) -> bool {
        let slot = &self.agents[idx];
        let probed = tokio::time::timeout(self.config.request_timeout + AGENT_GRACE, slot.agent.probe())
            .await
            .unwrap_or_else(|_| Err(AgentError::Timeout(slot.agent.id().to_string())));
        match probed {
            Ok(()) => {
                self.update_health(idx, HealthEvent::Succeeded);
                true
            }
            Err(e) => {
                debug!("Probe of {} failed: {e}", slot.agent.id());
                self.update_health(idx, HealthEvent::Failed(e.to_string()));
                false
            }
        }
    }

    fn eligible(&self, target: &CampaignTarget) -> Vec<usize> {
        (0..self.agents.len())
            .filter(|&i| self.agents[i].agent.can_reach(target) && self.agents[i].is_eligible())
            .collect()
    }

    /// Picks an agent and takes one of its permits. `prefer` binds the choice to one agent as
    /// long as it is eligible, agents in `tried` are only used when nothing else is left.
    async fn acquire(
        &self,
        target: &CampaignTarget,
        prefer: Option<usize>,
        tried: &[usize],
    ) -> Option<Acquired> {
        loop {
            let eligible = self.eligible(target);
            if eligible.is_empty() {
                let mut recovered = false;
                for idx in (0..self.agents.len()).filter(|&i| self.agents[i].agent.can_reach(target)) {
                    recovered |= self.probe(idx).await;
                }
                if recovered {
                    continue;
                }
                debug!("No agent available for {}", target.name);
                return None;
            }

            let mut candidates: Vec<usize> = match prefer.filter(|p| eligible.contains(p)) {
                Some(idx) => vec![idx],
                None => {
                    let untried: Vec<usize> =
                        eligible.iter().copied().filter(|i| !tried.contains(i)).collect();
                    if untried.is_empty() {
                        eligible
                    } else {
                        untried
                    }
                }
            };
            candidates.sort_by_key(|&i| {
                let slot = &self.agents[i];
                (slot.in_flight() * 1000 / slot.concurrency, i)
            });
            for &idx in &candidates {
                if let Ok(permit) = self.agents[idx].permits.clone().try_acquire_owned() {
                    return Some((idx, permit));
                }
            }

            trace!("Every agent for {} is saturated, waiting", target.name);
            let waits = candidates.iter().map(|&idx| {
                let permits = self.agents[idx].permits.clone();
                Box::pin(async move { (idx, permits.acquire_owned().await) })
            });
            let ((idx, permit), _, _) = select_all(waits).await;
            match permit {
                // Health may have changed while waiting
                Ok(permit) if self.agents[idx].is_eligible() => return Some((idx, permit)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn dispatch(
        &self,
        request: ExecutionRequest,
        first: Option<Acquired>,
        pin: Option<&Mutex<Option<usize>>>,
    ) -> ExecutionResult {
        let timeout = self.config.request_timeout;
        let mut tried = Vec::new();
        let mut attempts = 0u32;
        let mut last_error = format!("no agent can reach {}", request.target.name);
        let mut next = first;

        while let Some((idx, permit)) = next.take() {
            attempts += 1;
            let slot = &self.agents[idx];
            debug!(
                "Dispatching request {} to {} (attempt {attempts})",
                request.request_id,
                slot.agent.id()
            );
            let executed = tokio::time::timeout(timeout + AGENT_GRACE, slot.agent.execute(&request, timeout))
                .await
                .unwrap_or_else(|_| Err(AgentError::Timeout(slot.agent.id().to_string())));
            drop(permit);
            match executed {
                Ok(mut result) => {
                    slot.executed.fetch_add(1, Ordering::Relaxed);
                    self.update_health(idx, HealthEvent::Succeeded);
                    if let Some(pin) = pin {
                        *pin.lock().unwrap() = Some(idx);
                    }
                    result.attempts = attempts;
                    return result;
                }
                Err(e) => {
                    warn!("Request {} failed on {}: {e}", request.request_id, slot.agent.id());
                    slot.failures.fetch_add(1, Ordering::Relaxed);
                    self.update_health(idx, HealthEvent::Failed(e.to_string()));
                    last_error = e.to_string();
                    tried.push(idx);
                }
            }
            if attempts > self.config.max_retries {
                break;
            }
            tokio::time::sleep(self.config.retry_backoff).await;
            next = self.acquire(&request.target, None, &tried).await;
        }

        warn!(
            "Request {} is agent_unreachable after {attempts} attempts",
            request.request_id
        );
        ExecutionResult::agent_unreachable(&request, attempts, &last_error)
    }
}
