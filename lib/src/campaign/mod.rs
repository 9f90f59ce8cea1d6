//! ## Campaigns
//! A campaign fuzzes a fixed set of targets until the generator runs dry for every one of them
//! or the campaign is stopped.
//!
//! ```text
//! Pending -> Running -> Draining -> Completed
//!              ^  |
//!              |  v
//!             Paused            (any non-terminal) -> Failed
//! ```
//! One worker task per target pulls payloads and submits requests, one collector task receives
//! the results and feeds the deduplicator, the aggregator and the collaborators.
pub mod manager;

use crate::aggregate::{CampaignAggregator, CampaignRunSummary, RunStatus};
use crate::collaborators::{DefenseCorrelator, FeedbackSink, Judge, PayloadGenerator};
use crate::dedup::{CrashDeduplicator, DedupOutcome};
use crate::execution::{ExecutionResult, Outcome};
use crate::protocol::session::{SessionError, SessionManager, SessionRef};
use crate::protocol::{ConfigurationError, Params, ProtocolRegistry, ProtocolSpec};
use crate::runtime::{iterations_tracker, run_target, Dispatched};
use crate::scheduler::Scheduler;
use crate::store::CampaignStore;
use crate::target::CampaignTarget;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type CampaignId = String;

const MAX_SESSION_REPLACEMENTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Pending,
    Running,
    Paused,
    Draining,
    Completed,
    Failed,
}

impl CampaignState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignState::Completed | CampaignState::Failed)
    }

    fn can_become(self, next: CampaignState) -> bool {
        use CampaignState::*;
        match next {
            Failed => !self.is_terminal(),
            _ => matches!(
                (self, next),
                (Pending, Running)
                    | (Pending, Completed)
                    | (Running, Paused)
                    | (Paused, Running)
                    | (Running, Draining)
                    | (Paused, Draining)
                    | (Draining, Completed)
            ),
        }
    }
}

impl Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CampaignState::Pending => "pending",
            CampaignState::Running => "running",
            CampaignState::Paused => "paused",
            CampaignState::Draining => "draining",
            CampaignState::Completed => "completed",
            CampaignState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CampaignError {
    #[error("campaign {0} does not exist")]
    UnknownCampaign(CampaignId),
    #[error("campaign {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: CampaignId,
        from: CampaignState,
        to: CampaignState,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignSettings {
    pub generator_timeout: Duration,
    pub session_idle_timeout: Duration,
    /// Consecutive generator failures after which a target is given up
    pub max_generator_failures: u32,
    pub progress_interval: Duration,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            generator_timeout: Duration::from_secs(5),
            session_idle_timeout: Duration::from_secs(30),
            max_generator_failures: 3,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// The systems a campaign talks to. Only the generator is required.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn PayloadGenerator>,
    pub judge: Option<Arc<dyn Judge>>,
    pub correlator: Option<Arc<dyn DefenseCorrelator>>,
    pub feedback: Option<Arc<dyn FeedbackSink>>,
    pub store: Option<Arc<dyn CampaignStore>>,
}

impl Collaborators {
    pub fn new(generator: Arc<dyn PayloadGenerator>) -> Self {
        Self {
            generator,
            judge: None,
            correlator: None,
            feedback: None,
            store: None,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_correlator(mut self, correlator: Arc<dyn DefenseCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CampaignStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[derive(Debug)]
pub struct Campaign {
    pub(crate) id: CampaignId,
    targets: Vec<CampaignTarget>,
    pub(crate) registry: Arc<ProtocolRegistry>,
    pub(crate) scheduler: Scheduler,
    pub(crate) sessions: SessionManager,
    dedup: CrashDeduplicator,
    pub(crate) aggregator: Arc<CampaignAggregator>,
    pub(crate) collaborators: Collaborators,
    pub(crate) settings: CampaignSettings,
    state: watch::Sender<CampaignState>,
    pub(crate) cancel: CancellationToken,
    next_request_id: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl Campaign {
    pub fn new(
        id: impl Into<CampaignId>,
        targets: Vec<CampaignTarget>,
        registry: Arc<ProtocolRegistry>,
        scheduler: Scheduler,
        collaborators: Collaborators,
        settings: CampaignSettings,
    ) -> Result<Self, ConfigurationError> {
        if targets.is_empty() {
            return Err(ConfigurationError::NoTargets);
        }
        let mut names = HashSet::new();
        for target in &targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigurationError::DuplicateTarget(target.name.clone()));
            }
        }
        let id = id.into();
        let (state, _) = watch::channel(CampaignState::Pending);
        Ok(Self {
            aggregator: Arc::new(CampaignAggregator::new(id.clone(), &targets)),
            id,
            targets,
            registry,
            scheduler,
            sessions: SessionManager::new(settings.session_idle_timeout),
            dedup: CrashDeduplicator::new(),
            collaborators,
            settings,
            state,
            cancel: CancellationToken::new(),
            next_request_id: AtomicU64::new(1),
            failure: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn targets(&self) -> &[CampaignTarget] {
        &self.targets
    }

    pub fn state(&self) -> CampaignState {
        *self.state.borrow()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn deduplicator(&self) -> &CrashDeduplicator {
        &self.dedup
    }

    /// Why the campaign failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn transition(&self, next: CampaignState) -> Result<CampaignState, CampaignError> {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_become(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        match previous {
            Some(from) if changed => {
                debug!("Campaign {} {from} -> {next}", self.id);
                Ok(from)
            }
            _ => Err(CampaignError::InvalidTransition {
                id: self.id.clone(),
                from: self.state(),
                to: next,
            }),
        }
    }

    pub fn pause(&self) -> Result<(), CampaignError> {
        self.transition(CampaignState::Paused)?;
        info!("Campaign {} paused", self.id);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), CampaignError> {
        if self.state() != CampaignState::Paused {
            return Err(CampaignError::InvalidTransition {
                id: self.id.clone(),
                from: self.state(),
                to: CampaignState::Running,
            });
        }
        self.transition(CampaignState::Running)?;
        info!("Campaign {} resumed", self.id);
        Ok(())
    }

    /// Stops issuing new requests. In-flight requests still deliver their results.
    pub fn stop(&self) {
        info!("Stopping campaign {}", self.id);
        self.cancel.cancel();
        if self.transition(CampaignState::Completed).is_ok() {
            // Never started
            self.finalize(CampaignState::Completed);
        }
    }

    /// Waits until the campaign reached a terminal state, then returns its summary.
    pub async fn wait(&self) -> CampaignRunSummary {
        let mut state = self.state.subscribe();
        while !state.borrow_and_update().is_terminal() {
            if state.changed().await.is_err() {
                break;
            }
        }
        self.summary()
    }

    /// The frozen summary of a finished campaign, the live numbers otherwise.
    pub fn summary(&self) -> CampaignRunSummary {
        if let Some(summary) = self.aggregator.finalized() {
            return summary;
        }
        let sessions = self.sessions_per_target();
        self.aggregator.snapshot(RunStatus {
            state: self.state(),
            cancelled: self.cancel.is_cancelled(),
            sessions: &sessions,
        })
    }

    fn sessions_per_target(&self) -> BTreeMap<String, u64> {
        self.targets
            .iter()
            .map(|t| (t.name.clone(), self.sessions.sessions_opened_for(&t.name)))
            .collect()
    }

    fn finalize(&self, state: CampaignState) -> CampaignRunSummary {
        let sessions = self.sessions_per_target();
        self.aggregator.finalize(RunStatus {
            state,
            cancelled: self.cancel.is_cancelled(),
            sessions: &sessions,
        })
    }

    /// Blocks until the paused campaign is resumed. Returns false once the campaign is stopped.
    pub(crate) async fn wait_while_paused(&self) -> bool {
        let mut state = self.state.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if *state.borrow_and_update() != CampaignState::Paused {
                return true;
            }
            tokio::select! {
                changed = state.changed() => if changed.is_err() { return false },
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    /// The session reference for the next request to `target`. Expired sessions are replaced.
    pub(crate) async fn session_for(
        &self,
        target: &CampaignTarget,
        spec: &ProtocolSpec,
        params: &Params,
    ) -> Result<Option<SessionRef>, SessionError> {
        let mut replaced = 0;
        loop {
            let opened = self
                .sessions
                .open_session(target, spec, params)
                .and_then(|handle| self.sessions.advance(&handle));
            match opened {
                Ok(session) => return Ok(session),
                Err(e) if replaced < MAX_SESSION_REPLACEMENTS => {
                    let (SessionError::Expired(id) | SessionError::Closed(id)) = e;
                    debug!("Replacing session {id} of {}: {e}", target.name);
                    self.scheduler.release_session(id).await;
                    replaced += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_setup(&self) -> Result<Vec<CampaignTarget>, String> {
        for target in &self.targets {
            self.registry
                .lookup(&target.protocol)
                .map_err(|e| format!("target {}: {e}", target.name))?;
        }
        let (routable, unroutable): (Vec<_>, Vec<_>) = self
            .targets
            .iter()
            .cloned()
            .partition(|t| self.scheduler.has_route(t));
        if routable.is_empty() {
            return Err("no agent can reach any target".to_string());
        }
        for target in unroutable {
            warn!("No agent can reach {}, skipping it", target);
            self.aggregator.mark_exhausted(&target.name);
        }
        Ok(routable)
    }

    async fn fail(&self, reason: String) -> CampaignRunSummary {
        error!("Campaign {} failed: {reason}", self.id);
        *self.failure.lock().unwrap() = Some(reason);
        let summary = self.finalize(CampaignState::Failed);
        let _ = self.transition(CampaignState::Failed);
        self.persist(&summary).await;
        summary
    }

    async fn persist(&self, summary: &CampaignRunSummary) {
        let Some(store) = &self.collaborators.store else {
            return;
        };
        for record in self.dedup.records() {
            if let Err(e) = store.write_crash(&self.id, &record).await {
                error!("Could not store crash {}: {e}", record.fingerprint);
            }
        }
        if let Err(e) = store.write_summary(summary).await {
            error!("Could not store summary of {}: {e}", self.id);
        }
    }

    /// Runs the campaign to the end and returns its summary.
    pub async fn run(self: Arc<Self>) -> CampaignRunSummary {
        if self.transition(CampaignState::Running).is_err() {
            debug!("Campaign {} is {}, not starting it", self.id, self.state());
            return self.summary();
        }
        info!("Campaign {} started with {} targets", self.id, self.targets.len());
        let targets = match self.check_setup() {
            Ok(targets) => targets,
            Err(reason) => return self.fail(reason).await,
        };

        let background = CancellationToken::new();
        let prober = self.scheduler.spawn_health_prober(background.clone());
        let tracker = tokio::spawn(iterations_tracker(
            self.aggregator.clone(),
            self.settings.progress_interval,
            background.clone(),
        ));

        let (results, receiver) = mpsc::unbounded_channel();
        let collector = tokio::spawn(self.clone().collect(receiver));
        let workers: Vec<_> = targets
            .into_iter()
            .map(|target| tokio::spawn(run_target(self.clone(), target, results.clone())))
            .collect();
        drop(results);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker of campaign {} died: {e}", self.id);
            }
        }

        if let Err(e) = self.transition(CampaignState::Draining) {
            warn!("{e}");
        }
        if let Err(e) = collector.await {
            error!("Result collector of campaign {} died: {e}", self.id);
        }
        for session in self.sessions.close_all() {
            self.scheduler.release_session(session).await;
        }
        background.cancel();
        let _ = tokio::join!(prober, tracker);

        let live = self.summary();
        if live.executions > 0 && live.outcome(Outcome::AgentUnreachable) == live.executions {
            return self.fail("every request was agent_unreachable".to_string()).await;
        }
        let summary = self.finalize(CampaignState::Completed);
        if let Err(e) = self.transition(CampaignState::Completed) {
            warn!("{e}");
        }
        info!(
            "Campaign {} completed: {} executions, {} crashes, {} unique",
            self.id, summary.executions, summary.crash_count, summary.fingerprint_count
        );
        self.persist(&summary).await;
        summary
    }

    async fn collect(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Dispatched>) {
        let mut in_flight = FuturesUnordered::new();
        let mut open = true;
        loop {
            tokio::select! {
                dispatched = receiver.recv(), if open => match dispatched {
                    Some(Dispatched { target, payload, pending }) => in_flight.push(async move {
                        let result = pending.await;
                        (target, payload, result)
                    }),
                    None => open = false,
                },
                Some((target, payload, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.process(&target, &payload, result).await;
                }
                else => break,
            }
        }
        debug!("Collector of campaign {} done", self.id);
    }

    async fn process(&self, target: &CampaignTarget, payload: &[u8], result: ExecutionResult) {
        let dedup = self.dedup.record(&result, payload);
        if let (Some(DedupOutcome::NewFingerprint(fp)), Some(store)) = (&dedup, &self.collaborators.store) {
            if let Some(record) = self.dedup.get(fp) {
                if let Err(e) = store.write_crash(&self.id, &record).await {
                    error!("Could not store crash {fp}: {e}");
                }
            }
        }
        let defense = match &self.collaborators.correlator {
            Some(correlator) => correlator.correlate(&result).await,
            None => None,
        };
        let judgment = match &self.collaborators.judge {
            Some(judge) => Some(judge.judge(&result, defense.as_ref()).await),
            None => None,
        };
        self.aggregator
            .record(&result, dedup.as_ref(), judgment.as_ref());
        if let Some(feedback) = &self.collaborators.feedback {
            feedback.feedback(target, payload, &result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ExecutionAgent, LocalAgent};
    use crate::collaborators::{GeneratorContext, GeneratorError, Payload};
    use crate::harness::Harness;
    use crate::scheduler::SchedulerConfig;
    use crate::target::Endpoint;
    use async_trait::async_trait;

    /// Hands out `count` fixed payloads per target.
    #[derive(Debug)]
    struct FixedGenerator {
        count: u64,
    }

    #[async_trait]
    impl PayloadGenerator for FixedGenerator {
        async fn next_payload(
            &self,
            _target: &CampaignTarget,
            ctx: GeneratorContext<'_>,
        ) -> Result<Option<Payload>, GeneratorError> {
            Ok((ctx.issued < self.count).then(|| Payload::new(vec![ctx.issued as u8])))
        }
    }

    /// Fails every call.
    #[derive(Debug)]
    struct BrokenGenerator;

    #[async_trait]
    impl PayloadGenerator for BrokenGenerator {
        async fn next_payload(
            &self,
            _target: &CampaignTarget,
            _ctx: GeneratorContext<'_>,
        ) -> Result<Option<Payload>, GeneratorError> {
            Err(GeneratorError::Failed("model offline".to_string()))
        }
    }

    fn campaign(targets: Vec<CampaignTarget>, generator: Arc<dyn PayloadGenerator>) -> Arc<Campaign> {
        let registry = Arc::new(ProtocolRegistry::with_builtin());
        let harness = Arc::new(Harness::new(registry.clone()));
        let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness));
        let scheduler = Scheduler::new(vec![(agent, 2)], SchedulerConfig::default()).unwrap();
        Arc::new(
            Campaign::new(
                "campaign-0001",
                targets,
                registry,
                scheduler,
                Collaborators::new(generator),
                CampaignSettings::default(),
            )
            .unwrap(),
        )
    }

    fn closed_port_target(name: &str, protocol: &str) -> CampaignTarget {
        // Port 9 (discard) is closed on test machines, every request is a protocol error
        CampaignTarget::new(name, protocol, Endpoint::new("127.0.0.1", 9))
    }

    #[test]
    fn transitions() {
        use CampaignState::*;
        assert!(Pending.can_become(Running));
        assert!(Running.can_become(Paused));
        assert!(Paused.can_become(Draining));
        assert!(!Completed.can_become(Running));
        assert!(!Completed.can_become(Failed));
        assert!(Draining.can_become(Failed));
        assert!(!Draining.can_become(Paused));
    }

    #[test]
    fn rejects_bad_target_lists() {
        let registry = Arc::new(ProtocolRegistry::with_builtin());
        let scheduler = Scheduler::new(vec![], SchedulerConfig::default()).unwrap();
        let generator: Arc<dyn PayloadGenerator> = Arc::new(FixedGenerator { count: 1 });
        let none = Campaign::new(
            "c",
            vec![],
            registry.clone(),
            scheduler.clone(),
            Collaborators::new(generator.clone()),
            CampaignSettings::default(),
        );
        assert_eq!(none.unwrap_err(), ConfigurationError::NoTargets);
        let twice = Campaign::new(
            "c",
            vec![closed_port_target("a", "http"), closed_port_target("a", "coap")],
            registry,
            scheduler,
            Collaborators::new(generator),
            CampaignSettings::default(),
        );
        assert_eq!(
            twice.unwrap_err(),
            ConfigurationError::DuplicateTarget("a".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_protocol_fails_the_campaign() {
        let campaign = campaign(
            vec![closed_port_target("x", "dnp3")],
            Arc::new(FixedGenerator { count: 1 }),
        );
        let summary = campaign.clone().run().await;
        assert_eq!(summary.state, CampaignState::Failed);
        assert_eq!(campaign.state(), CampaignState::Failed);
        assert!(campaign.failure().unwrap().contains("dnp3"));
    }

    #[tokio::test]
    async fn runs_until_generator_is_exhausted() {
        let campaign = campaign(
            vec![closed_port_target("web", "http")],
            Arc::new(FixedGenerator { count: 5 }),
        );
        let summary = campaign.clone().run().await;
        assert_eq!(summary.state, CampaignState::Completed);
        assert_eq!(summary.executions, 5);
        assert_eq!(summary.outcome(Outcome::ProtocolError), 5);
        assert!(summary.target("web").unwrap().exhausted);
        assert!(!summary.cancelled);
        // Idempotent once completed
        assert_eq!(campaign.summary(), summary);
        assert_eq!(campaign.wait().await, summary);
    }

    #[tokio::test]
    async fn failing_generator_gives_up_the_target() {
        let campaign = campaign(vec![closed_port_target("web", "http")], Arc::new(BrokenGenerator));
        let summary = campaign.clone().run().await;
        assert_eq!(summary.state, CampaignState::Completed);
        assert_eq!(summary.executions, 0);
    }

    #[tokio::test]
    async fn stop_before_start_completes_cancelled() {
        let campaign = campaign(
            vec![closed_port_target("web", "http")],
            Arc::new(FixedGenerator { count: 5 }),
        );
        campaign.stop();
        assert_eq!(campaign.state(), CampaignState::Completed);
        let summary = campaign.clone().run().await;
        assert!(summary.cancelled);
        assert_eq!(summary.executions, 0);
    }

    #[tokio::test]
    async fn pause_only_while_running() {
        let campaign = campaign(
            vec![closed_port_target("web", "http")],
            Arc::new(FixedGenerator { count: 1 }),
        );
        assert!(matches!(
            campaign.pause(),
            Err(CampaignError::InvalidTransition { .. })
        ));
        assert!(campaign.resume().is_err());
    }
}
