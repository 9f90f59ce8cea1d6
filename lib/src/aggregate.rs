//! Per-target and per-campaign roll-ups of execution results.
use crate::campaign::CampaignState;
use crate::collaborators::{Judgment, Verdict};
use crate::dedup::{DedupOutcome, Fingerprint};
use crate::execution::{now_unix_ms, ExecutionResult, Outcome};
use crate::target::CampaignTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub target: String,
    pub protocol: String,
    pub executions: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub sessions_opened: u64,
    pub new_behaviours: u64,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
    /// The generator ran out of payloads for this target
    pub exhausted: bool,
    pub outcomes: BTreeMap<Outcome, u64>,
}

/// One execution as the summary lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    pub request_id: u64,
    pub target: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRunSummary {
    pub campaign_id: String,
    pub state: CampaignState,
    pub cancelled: bool,
    pub executions: u64,
    pub crash_count: u64,
    pub fingerprint_count: u64,
    pub sessions_opened: u64,
    pub new_behaviours: u64,
    pub judged: u64,
    pub average_score: f64,
    /// Executions per second over the whole run
    pub throughput: f64,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub outcomes: BTreeMap<Outcome, u64>,
    pub verdicts: BTreeMap<Verdict, u64>,
    pub targets: Vec<TargetSummary>,
    /// Every recorded execution, in the order results arrived
    #[serde(default)]
    pub results: Vec<ResultRef>,
}

impl CampaignRunSummary {
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn target(&self, name: &str) -> Option<&TargetSummary> {
        self.targets.iter().find(|t| t.target == name)
    }

    pub fn results_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a ResultRef> + 'a {
        self.results.iter().filter(move |r| r.target == target)
    }
}

#[derive(Debug, Default)]
struct TargetStats {
    protocol: String,
    executions: u64,
    crashes: u64,
    unique_crashes: u64,
    new_behaviours: u64,
    latency_total: Duration,
    latency_max: Duration,
    exhausted: bool,
    outcomes: BTreeMap<Outcome, u64>,
}

#[derive(Debug, Default)]
struct AggregateState {
    targets: BTreeMap<String, TargetStats>,
    outcomes: BTreeMap<Outcome, u64>,
    verdicts: BTreeMap<Verdict, u64>,
    executions: u64,
    crashes: u64,
    fingerprints: u64,
    new_behaviours: u64,
    score_sum: f64,
    judged: u64,
    results: Vec<ResultRef>,
    finished: Option<Duration>,
    frozen: Option<CampaignRunSummary>,
}

/// Counts results while a campaign runs. Once [`CampaignAggregator::finalize`] has been called
/// the summary is frozen and every later call returns the same value.
#[derive(Debug)]
pub struct CampaignAggregator {
    campaign_id: String,
    started: Instant,
    started_at_ms: u64,
    state: Mutex<AggregateState>,
}

/// Facts about the run the aggregator does not track itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus<'a> {
    pub state: CampaignState,
    pub cancelled: bool,
    /// Sessions opened per target
    pub sessions: &'a BTreeMap<String, u64>,
}

impl CampaignAggregator {
    pub fn new(campaign_id: impl Into<String>, targets: &[CampaignTarget]) -> Self {
        let targets = targets
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    TargetStats {
                        protocol: t.protocol.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            campaign_id: campaign_id.into(),
            started: Instant::now(),
            started_at_ms: now_unix_ms(),
            state: Mutex::new(AggregateState {
                targets,
                ..Default::default()
            }),
        }
    }

    pub fn record(
        &self,
        result: &ExecutionResult,
        dedup: Option<&DedupOutcome>,
        judgment: Option<&Judgment>,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.frozen.is_some() {
            return;
        }
        state.executions += 1;
        *state.outcomes.entry(result.outcome).or_default() += 1;
        state.new_behaviours += u64::from(result.coverage.new_behaviours);
        if result.is_crash() {
            state.crashes += 1;
        }
        let new_fingerprint = dedup.is_some_and(DedupOutcome::is_new);
        if new_fingerprint {
            state.fingerprints += 1;
        }
        if let Some(judgment) = judgment {
            state.judged += 1;
            state.score_sum += judgment.score;
            *state.verdicts.entry(judgment.verdict).or_default() += 1;
        }

        let target = state.targets.entry(result.target.clone()).or_default();
        target.executions += 1;
        *target.outcomes.entry(result.outcome).or_default() += 1;
        target.new_behaviours += u64::from(result.coverage.new_behaviours);
        target.latency_total += result.latency;
        target.latency_max = target.latency_max.max(result.latency);
        if result.is_crash() {
            target.crashes += 1;
        }
        if new_fingerprint {
            target.unique_crashes += 1;
        }
        state.results.push(ResultRef {
            request_id: result.request_id,
            target: result.target.clone(),
            outcome: result.outcome,
            fingerprint: dedup.map(|d| d.fingerprint().clone()),
        });
    }

    pub fn mark_exhausted(&self, target: &str) {
        if let Some(stats) = self.state.lock().unwrap().targets.get_mut(target) {
            stats.exhausted = true;
        }
    }

    pub fn executions(&self) -> u64 {
        self.state.lock().unwrap().executions
    }

    /// Current numbers. Returns the frozen summary once the campaign has been finalized.
    pub fn snapshot(&self, status: RunStatus<'_>) -> CampaignRunSummary {
        let state = self.state.lock().unwrap();
        if let Some(frozen) = &state.frozen {
            return frozen.clone();
        }
        self.build(&state, status, self.started.elapsed())
    }

    /// Freezes the summary. Calling it again returns the first result unchanged.
    pub fn finalize(&self, status: RunStatus<'_>) -> CampaignRunSummary {
        let mut state = self.state.lock().unwrap();
        if let Some(frozen) = &state.frozen {
            return frozen.clone();
        }
        let elapsed = *state.finished.get_or_insert_with(|| self.started.elapsed());
        let summary = self.build(&state, status, elapsed);
        state.frozen = Some(summary.clone());
        summary
    }

    pub fn finalized(&self) -> Option<CampaignRunSummary> {
        self.state.lock().unwrap().frozen.clone()
    }

    fn build(
        &self,
        state: &AggregateState,
        status: RunStatus<'_>,
        elapsed: Duration,
    ) -> CampaignRunSummary {
        let targets: Vec<TargetSummary> = state
            .targets
            .iter()
            .map(|(name, stats)| TargetSummary {
                target: name.clone(),
                protocol: stats.protocol.clone(),
                executions: stats.executions,
                crashes: stats.crashes,
                unique_crashes: stats.unique_crashes,
                sessions_opened: status.sessions.get(name).copied().unwrap_or(0),
                new_behaviours: stats.new_behaviours,
                mean_latency_ms: if stats.executions == 0 {
                    0.0
                } else {
                    stats.latency_total.as_secs_f64() * 1000.0 / stats.executions as f64
                },
                max_latency_ms: stats.latency_max.as_secs_f64() * 1000.0,
                exhausted: stats.exhausted,
                outcomes: stats.outcomes.clone(),
            })
            .collect();
        let secs = elapsed.as_secs_f64();
        CampaignRunSummary {
            campaign_id: self.campaign_id.clone(),
            state: status.state,
            cancelled: status.cancelled,
            executions: state.executions,
            crash_count: state.crashes,
            fingerprint_count: state.fingerprints,
            sessions_opened: targets.iter().map(|t| t.sessions_opened).sum(),
            new_behaviours: state.new_behaviours,
            judged: state.judged,
            average_score: if state.judged == 0 {
                0.0
            } else {
                state.score_sum / state.judged as f64
            },
            throughput: if secs > 0.0 {
                state.executions as f64 / secs
            } else {
                0.0
            },
            started_at_ms: self.started_at_ms,
            duration_ms: elapsed.as_millis() as u64,
            outcomes: state.outcomes.clone(),
            verdicts: state.verdicts.clone(),
            targets,
            results: state.results.clone(),
        }
    }
}
