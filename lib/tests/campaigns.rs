use async_trait::async_trait;
use fuzzgrid::agent::{AgentError, ExecutionAgent, LocalAgent};
use fuzzgrid::aggregate::CampaignRunSummary;
use fuzzgrid::campaign::{Campaign, CampaignSettings, CampaignState, Collaborators};
use fuzzgrid::collaborators::{
    DefenseSignal, FeedbackSink, GeneratorContext, GeneratorError, Judge, Judgment, Payload,
    PayloadGenerator, Verdict,
};
use fuzzgrid::execution::{ExecutionRequest, ExecutionResult, Outcome};
use fuzzgrid::harness::Harness;
use fuzzgrid::protocol::session::SessionId;
use fuzzgrid::protocol::ProtocolRegistry;
use fuzzgrid::scheduler::health::AgentHealth;
use fuzzgrid::scheduler::{Scheduler, SchedulerConfig};
use fuzzgrid::store::FileStore;
use fuzzgrid::target::{CampaignTarget, Endpoint};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// `count` payloads per target.
#[derive(Debug)]
struct Fixed {
    count: u64,
}

#[async_trait]
impl PayloadGenerator for Fixed {
    async fn next_payload(
        &self,
        _target: &CampaignTarget,
        ctx: GeneratorContext<'_>,
    ) -> Result<Option<Payload>, GeneratorError> {
        Ok((ctx.issued < self.count).then(|| Payload::new(vec![0x03, 0x00, ctx.issued as u8, 0x00, 0x01])))
    }
}

/// Like [`Fixed`], but waits `pause` before handing out payload number `pause_before`.
#[derive(Debug)]
struct Hesitant {
    count: u64,
    pause_before: u64,
    pause: Duration,
}

#[async_trait]
impl PayloadGenerator for Hesitant {
    async fn next_payload(
        &self,
        target: &CampaignTarget,
        ctx: GeneratorContext<'_>,
    ) -> Result<Option<Payload>, GeneratorError> {
        if ctx.issued == self.pause_before {
            tokio::time::sleep(self.pause).await;
        }
        Fixed { count: self.count }.next_payload(target, ctx).await
    }
}

/// Keeps every result it is fed.
#[derive(Debug, Default)]
struct Recorder {
    results: Mutex<Vec<ExecutionResult>>,
}

impl Recorder {
    fn results(&self) -> Vec<ExecutionResult> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedbackSink for Recorder {
    async fn feedback(&self, _target: &CampaignTarget, _payload: &[u8], result: &ExecutionResult) {
        self.results.lock().unwrap().push(result.clone());
    }
}

/// Escalates crashes, monitors everything else.
#[derive(Debug)]
struct CrashJudge;

#[async_trait]
impl Judge for CrashJudge {
    async fn judge(&self, result: &ExecutionResult, _defense: Option<&DefenseSignal>) -> Judgment {
        if result.is_crash() {
            Judgment::new(Verdict::Escalate, 1.0)
        } else {
            Judgment::new(Verdict::Monitor, 0.0)
        }
    }
}

/// Answers like a local agent until `works_for` executions are done, then is unreachable.
#[derive(Debug)]
struct FlakyAgent {
    inner: LocalAgent,
    works_for: usize,
    executed: AtomicUsize,
}

#[async_trait]
impl ExecutionAgent for FlakyAgent {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn can_reach(&self, target: &CampaignTarget) -> bool {
        self.inner.can_reach(target)
    }

    async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> Result<ExecutionResult, AgentError> {
        if self.executed.fetch_add(1, Ordering::SeqCst) >= self.works_for {
            return Err(self.down());
        }
        self.inner.execute(request, timeout).await
    }

    async fn probe(&self) -> Result<(), AgentError> {
        if self.executed.load(Ordering::SeqCst) >= self.works_for {
            return Err(self.down());
        }
        Ok(())
    }

    async fn close_session(&self, session: SessionId) {
        self.inner.close_session(session).await
    }
}

impl FlakyAgent {
    fn new(id: &str, harness: Arc<Harness>, works_for: usize) -> Self {
        Self {
            inner: LocalAgent::new(id, harness),
            works_for,
            executed: AtomicUsize::new(0),
        }
    }

    fn down(&self) -> AgentError {
        AgentError::Unreachable {
            agent: self.inner.id().to_string(),
            reason: "connection refused".to_string(),
        }
    }
}

/// Sleeps instead of executing and remembers the highest parallelism it saw.
#[derive(Debug, Default)]
struct SlowAgent {
    id: String,
    running: AtomicUsize,
    max_running: AtomicUsize,
    executed: AtomicUsize,
}

#[async_trait]
impl ExecutionAgent for SlowAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_reach(&self, _target: &CampaignTarget) -> bool {
        true
    }

    async fn execute(&self, request: &ExecutionRequest, _timeout: Duration) -> Result<ExecutionResult, AgentError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionResult::new(request, Outcome::Success))
    }

    async fn probe(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn close_session(&self, _session: SessionId) {}
}

/// Echoes Modbus frames back. Returns the port, the number of accepted connections and the
/// transaction ids in arrival order.
async fn modbus_target() -> (u16, Arc<AtomicUsize>, Arc<Mutex<Vec<u16>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let transactions = Arc::new(Mutex::new(Vec::new()));
    let (counter, seen) = (accepted.clone(), transactions.clone());
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if n >= 2 {
                        seen.lock().unwrap().push(u16::from_be_bytes([buf[0], buf[1]]));
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (port, accepted, transactions)
}

/// Acknowledges every CoAP message with 2.05 Content.
async fn coap_target() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let token_len = (buf[0] & 0x0F) as usize;
            let mut answer = vec![0x60 | (buf[0] & 0x0F), 0x45, buf[2], buf[3]];
            answer.extend_from_slice(&buf[4..(4 + token_len).min(n)]);
            let _ = socket.send_to(&answer, peer).await;
        }
    });
    port
}

/// Answers every HTTP request with the given status line.
async fn http_target(status: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let answer = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n");
                let _ = stream.write_all(answer.as_bytes()).await;
            });
        }
    });
    port
}

/// Accepts connections and never answers.
async fn silent_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

fn target(name: &str, protocol: &str, port: u16) -> CampaignTarget {
    CampaignTarget::new(name, protocol, Endpoint::new("127.0.0.1", port))
}

fn registry_and_harness() -> (Arc<ProtocolRegistry>, Arc<Harness>) {
    let registry = Arc::new(ProtocolRegistry::with_builtin());
    let harness = Arc::new(Harness::new(registry.clone()));
    (registry, harness)
}

fn config(request_timeout: Duration) -> SchedulerConfig {
    SchedulerConfig {
        request_timeout,
        retry_backoff: Duration::from_millis(5),
        ..SchedulerConfig::default()
    }
}

async fn run(
    targets: Vec<CampaignTarget>,
    registry: Arc<ProtocolRegistry>,
    scheduler: Scheduler,
    collaborators: Collaborators,
) -> (Arc<Campaign>, CampaignRunSummary) {
    run_with(targets, registry, scheduler, collaborators, CampaignSettings::default()).await
}

async fn run_with(
    targets: Vec<CampaignTarget>,
    registry: Arc<ProtocolRegistry>,
    scheduler: Scheduler,
    collaborators: Collaborators,
    settings: CampaignSettings,
) -> (Arc<Campaign>, CampaignRunSummary) {
    let campaign = Arc::new(
        Campaign::new("campaign-0001", targets, registry, scheduler, collaborators, settings).unwrap(),
    );
    let summary = tokio::time::timeout(Duration::from_secs(10), campaign.clone().run())
        .await
        .expect("campaign did not finish within 10s");
    (campaign, summary)
}

#[tokio::test]
async fn stateless_and_stateful_targets_share_one_agent() {
    let coap_port = coap_target().await;
    let (modbus_port, connections, _) = modbus_target().await;
    let (registry, harness) = registry_and_harness();
    let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness));
    let scheduler = Scheduler::new(vec![(agent, 4)], config(Duration::from_millis(500))).unwrap();
    let collaborators = Collaborators::new(Arc::new(Fixed { count: 10 }));

    let (campaign, summary) = run(
        vec![target("sensor", "coap", coap_port), target("plc", "modbus", modbus_port)],
        registry,
        scheduler,
        collaborators,
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.executions, 20);
    assert_eq!(summary.outcome(Outcome::Success), 20);
    assert_eq!(summary.results.len(), 20);
    let ids: HashSet<_> = summary.results.iter().map(|r| r.request_id).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(summary.results_for("plc").count(), 10);
    assert!(summary.results.iter().all(|r| r.fingerprint.is_none()));
    assert_eq!(summary.target("plc").unwrap().sessions_opened, 1);
    assert_eq!(summary.target("sensor").unwrap().sessions_opened, 0);
    assert_eq!(summary.sessions_opened, 1);
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(summary.targets.iter().all(|t| t.exhausted));
    // Sessions and lanes are gone once the campaign is over
    assert_eq!(campaign.sessions().active_sessions(), 0);
    assert_eq!(campaign.scheduler().active_lanes(), 0);
}

#[tokio::test]
async fn session_requests_arrive_in_order() {
    let (port, connections, transactions) = modbus_target().await;
    let (registry, harness) = registry_and_harness();
    let first: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness.clone()));
    let second: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-1", harness));
    let scheduler = Scheduler::new(vec![(first, 4), (second, 4)], config(Duration::from_millis(500))).unwrap();
    let (_, summary) = run(
        vec![target("plc", "modbus", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 25 })),
    )
    .await;

    assert_eq!(summary.outcome(Outcome::Success), 25);
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    let seen = transactions.lock().unwrap().clone();
    assert_eq!(seen.len(), 25);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
}

#[tokio::test]
async fn failing_agent_is_replaced_by_the_other_one() {
    let port = http_target("200 OK").await;
    let (registry, harness) = registry_and_harness();
    let flaky: Arc<dyn ExecutionAgent> = Arc::new(FlakyAgent::new("flaky", harness.clone(), 5));
    let steady: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("steady", harness));
    let scheduler = Scheduler::new(vec![(flaky, 1), (steady, 1)], config(Duration::from_millis(500))).unwrap();
    let recorder = Arc::new(Recorder::default());
    let (_, summary) = run(
        vec![target("web", "http", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 10 })).with_feedback(recorder.clone()),
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.executions, 10);
    assert_eq!(summary.outcome(Outcome::Success), 10);
    assert_eq!(summary.outcome(Outcome::AgentUnreachable), 0);
    let by_flaky = recorder
        .results()
        .iter()
        .filter(|r| r.agent.as_deref() == Some("flaky"))
        .count();
    assert!(by_flaky <= 5);
}

#[tokio::test]
async fn without_a_replacement_requests_become_agent_unreachable() {
    let port = http_target("200 OK").await;
    let (registry, harness) = registry_and_harness();
    let flaky: Arc<dyn ExecutionAgent> = Arc::new(FlakyAgent::new("flaky", harness, 5));
    let scheduler = Scheduler::new(vec![(flaky, 1)], config(Duration::from_millis(500))).unwrap();
    let (campaign, summary) = run(
        vec![target("web", "http", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 10 })),
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.executions, 10);
    assert_eq!(summary.outcome(Outcome::Success), 5);
    assert_eq!(summary.outcome(Outcome::AgentUnreachable), 5);
    let status = campaign.scheduler().agent_status();
    assert_eq!(status[0].health, AgentHealth::Unhealthy);
}

#[tokio::test]
async fn session_moves_to_the_other_agent_when_its_agent_fails() {
    let (port, connections, transactions) = modbus_target().await;
    let (registry, harness) = registry_and_harness();
    let flaky: Arc<dyn ExecutionAgent> = Arc::new(FlakyAgent::new("flaky", harness.clone(), 5));
    let steady: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("steady", harness));
    let scheduler = Scheduler::new(vec![(flaky, 1), (steady, 1)], config(Duration::from_millis(500))).unwrap();
    let (campaign, summary) = run(
        vec![target("plc", "modbus", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 10 })),
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.outcome(Outcome::Success), 10);
    assert_eq!(summary.sessions_opened, 1);
    // Both agents share the harness, so the session keeps its connection
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    let seen = transactions.lock().unwrap().clone();
    assert_eq!(seen.len(), 10);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
    assert_eq!(campaign.scheduler().active_lanes(), 0);
}

#[tokio::test]
async fn session_requests_become_agent_unreachable_without_a_replacement() {
    let (port, _, _) = modbus_target().await;
    let (registry, harness) = registry_and_harness();
    let flaky: Arc<dyn ExecutionAgent> = Arc::new(FlakyAgent::new("flaky", harness, 5));
    let scheduler = Scheduler::new(vec![(flaky, 1)], config(Duration::from_millis(500))).unwrap();
    let (campaign, summary) = run(
        vec![target("plc", "modbus", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 10 })),
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.executions, 10);
    assert_eq!(summary.outcome(Outcome::Success), 5);
    assert_eq!(summary.outcome(Outcome::AgentUnreachable), 5);
    let mut unreachable: Vec<u64> = summary
        .results
        .iter()
        .filter(|r| r.outcome == Outcome::AgentUnreachable)
        .map(|r| r.request_id)
        .collect();
    unreachable.sort();
    assert_eq!(unreachable, vec![6, 7, 8, 9, 10]);
    assert_eq!(campaign.scheduler().agent_status()[0].health, AgentHealth::Unhealthy);
}

#[tokio::test]
async fn idle_sessions_are_reopened() {
    let (port, connections, _) = modbus_target().await;
    let (registry, harness) = registry_and_harness();
    let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness));
    let scheduler = Scheduler::new(vec![(agent, 2)], config(Duration::from_millis(500))).unwrap();
    let generator = Hesitant {
        count: 6,
        pause_before: 3,
        pause: Duration::from_millis(300),
    };
    let settings = CampaignSettings {
        session_idle_timeout: Duration::from_millis(100),
        ..CampaignSettings::default()
    };
    let (campaign, summary) = run_with(
        vec![target("plc", "modbus", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(generator)),
        settings,
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.outcome(Outcome::Success), 6);
    assert_eq!(summary.target("plc").unwrap().sessions_opened, 2);
    assert_eq!(campaign.sessions().expired_count(), 1);
    // Releasing the expired session dropped its connection
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(campaign.scheduler().active_lanes(), 0);
}

#[tokio::test]
async fn campaign_fails_when_no_request_reaches_an_agent() {
    let port = http_target("200 OK").await;
    let (registry, harness) = registry_and_harness();
    let dead: Arc<dyn ExecutionAgent> = Arc::new(FlakyAgent::new("dead", harness, 0));
    let scheduler = Scheduler::new(vec![(dead, 2)], config(Duration::from_millis(200))).unwrap();
    let (campaign, summary) = run(
        vec![target("web", "http", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 3 })),
    )
    .await;

    assert_eq!(summary.state, CampaignState::Failed);
    assert_eq!(summary.outcome(Outcome::AgentUnreachable), 3);
    assert!(campaign.failure().is_some());
}

#[tokio::test]
async fn saturated_agents_apply_backpressure() {
    let registry = Arc::new(ProtocolRegistry::with_builtin());
    let first = Arc::new(SlowAgent {
        id: "slow-0".to_string(),
        ..SlowAgent::default()
    });
    let second = Arc::new(SlowAgent {
        id: "slow-1".to_string(),
        ..SlowAgent::default()
    });
    let (first_agent, second_agent): (Arc<dyn ExecutionAgent>, Arc<dyn ExecutionAgent>) =
        (first.clone(), second.clone());
    let scheduler = Scheduler::new(
        vec![(first_agent, 2), (second_agent, 2)],
        config(Duration::from_millis(500)),
    )
    .unwrap();
    let (_, summary) = run(
        vec![target("web", "http", 1), target("api", "grpc", 2)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 20 })),
    )
    .await;

    assert_eq!(summary.executions, 40);
    assert_eq!(
        first.executed.load(Ordering::SeqCst) + second.executed.load(Ordering::SeqCst),
        40
    );
    assert!(first.max_running.load(Ordering::SeqCst) <= 2);
    assert!(second.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn timeouts_do_not_hurt_agent_health() {
    let port = silent_target().await;
    let (registry, harness) = registry_and_harness();
    let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness));
    let scheduler = Scheduler::new(vec![(agent, 2)], config(Duration::from_millis(100))).unwrap();
    let (campaign, summary) = run(
        vec![target("web", "http", port)],
        registry,
        scheduler,
        Collaborators::new(Arc::new(Fixed { count: 3 })),
    )
    .await;

    assert_eq!(summary.state, CampaignState::Completed);
    assert_eq!(summary.outcome(Outcome::Timeout), 3);
    assert_eq!(summary.crash_count, 0);
    let status = campaign.scheduler().agent_status();
    assert_eq!(status[0].health, AgentHealth::Healthy);
    assert_eq!(status[0].failures, 0);
}

#[tokio::test]
async fn crashes_are_deduplicated_judged_and_stored() {
    let port = http_target("500 Internal Server Error").await;
    let (registry, harness) = registry_and_harness();
    let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness));
    let scheduler = Scheduler::new(vec![(agent, 2)], config(Duration::from_millis(500))).unwrap();
    let root = std::env::temp_dir().join(format!("fuzzgrid-it-{}", uuid::Uuid::new_v4()));
    let collaborators = Collaborators::new(Arc::new(Fixed { count: 5 }))
        .with_judge(Arc::new(CrashJudge))
        .with_store(Arc::new(FileStore::new(root.clone())));
    let (campaign, summary) = run(vec![target("web", "http", port)], registry, scheduler, collaborators).await;

    assert_eq!(summary.crash_count, 5);
    assert_eq!(summary.fingerprint_count, 1);
    assert_eq!(summary.judged, 5);
    assert_eq!(summary.verdicts.get(&Verdict::Escalate), Some(&5));
    let records = campaign.deduplicator().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].occurrence_count, 5);

    // Summary stays the same once completed
    assert_eq!(campaign.summary(), summary);
    assert_eq!(campaign.wait().await, summary);

    let dir = root.join("campaign-0001");
    let stored: CampaignRunSummary =
        toml::from_str(&tokio::fs::read_to_string(dir.join("summary.toml")).await.unwrap()).unwrap();
    assert_eq!(stored.crash_count, 5);
    let crash = FileStore::read_crash(dir.join(format!("crash-{}.toml", records[0].fingerprint)))
        .await
        .unwrap();
    assert_eq!(crash.occurrence_count, 5);
    let _ = tokio::fs::remove_dir_all(root).await;
}

#[tokio::test]
async fn stop_keeps_partial_results() {
    let port = http_target("200 OK").await;
    let (registry, harness) = registry_and_harness();
    let agent: Arc<dyn ExecutionAgent> = Arc::new(LocalAgent::new("local-0", harness));
    let scheduler = Scheduler::new(vec![(agent, 2)], config(Duration::from_millis(500))).unwrap();
    let campaign = Arc::new(
        Campaign::new(
            "campaign-0001",
            vec![target("web", "http", port)],
            registry,
            scheduler,
            Collaborators::new(Arc::new(Fixed { count: u64::MAX })),
            CampaignSettings::default(),
        )
        .unwrap(),
    );
    let running = tokio::spawn(campaign.clone().run());
    while campaign.summary().executions < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    campaign.stop();
    let summary = running.await.unwrap();
    assert_eq!(summary.state, CampaignState::Completed);
    assert!(summary.cancelled);
    assert!(summary.executions >= 5);
    assert!(!summary.target("web").unwrap().exhausted);
}
