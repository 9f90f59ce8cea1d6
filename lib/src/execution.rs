//! Requests handed to execution agents and the results they send back.
use crate::protocol::session::SessionRef;
use crate::protocol::Params;
use crate::target::CampaignTarget;
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique within the campaign
    pub request_id: u64,
    pub target: CampaignTarget,
    pub session: Option<SessionRef>,
    #[serde_as(as = "Hex")]
    pub payload: Vec<u8>,
    /// Per-request parameter overrides, applied on top of the protocol defaults
    #[serde(default)]
    pub params: Params,
    pub dispatched_at_ms: u64,
}

impl ExecutionRequest {
    pub fn new(request_id: u64, target: CampaignTarget, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            target,
            session: None,
            payload,
            params: Params::new(),
            dispatched_at_ms: now_unix_ms(),
        }
    }

    pub fn with_session(mut self, session: Option<SessionRef>) -> Self {
        self.session = session;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    ProtocolError,
    Timeout,
    Crash,
    AgentUnreachable,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Success,
        Outcome::ProtocolError,
        Outcome::Timeout,
        Outcome::Crash,
        Outcome::AgentUnreachable,
    ];
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::ProtocolError => write!(f, "protocol_error"),
            Outcome::Timeout => write!(f, "timeout"),
            Outcome::Crash => write!(f, "crash"),
            Outcome::AgentUnreachable => write!(f, "agent_unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum CrashKind {
    /// The supervised target process was killed by a signal
    Signal(i32),
    /// The supervised target process exited on its own
    ExitCode(i32),
    /// The target answered with a fatal protocol response
    ProtocolFatal(String),
    /// The target tore the connection down mid-exchange
    ConnectionReset,
}

impl CrashKind {
    pub fn class(&self) -> &'static str {
        match self {
            CrashKind::Signal(_) => "signal",
            CrashKind::ExitCode(_) => "exit",
            CrashKind::ProtocolFatal(_) => "protocol_fatal",
            CrashKind::ConnectionReset => "connection_reset",
        }
    }
}

/// Raw crash data, uninterpreted. Fingerprinting happens in [`crate::dedup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashSignal {
    pub kind: CrashKind,
    pub diagnostic: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageDelta {
    /// Responses this harness had not seen from the target before
    pub new_behaviours: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: u64,
    pub target: String,
    pub outcome: Outcome,
    pub signal: Option<CrashSignal>,
    pub latency: Duration,
    pub coverage: CoverageDelta,
    /// Start of the response or of the target's stderr
    pub excerpt: String,
    pub agent: Option<String>,
    pub attempts: u32,
}

impl ExecutionResult {
    pub fn new(request: &ExecutionRequest, outcome: Outcome) -> Self {
        Self {
            request_id: request.request_id,
            target: request.target.name.clone(),
            outcome,
            signal: None,
            latency: Duration::ZERO,
            coverage: CoverageDelta::default(),
            excerpt: String::new(),
            agent: None,
            attempts: 1,
        }
    }

    pub fn agent_unreachable(request: &ExecutionRequest, attempts: u32, reason: &str) -> Self {
        Self {
            excerpt: reason.to_string(),
            attempts,
            ..Self::new(request, Outcome::AgentUnreachable)
        }
    }

    pub fn with_signal(mut self, signal: CrashSignal) -> Self {
        self.outcome = Outcome::Crash;
        self.signal = Some(signal);
        self
    }

    pub fn is_crash(&self) -> bool {
        self.outcome == Outcome::Crash
    }
}

const EXCERPT_LIMIT: usize = 256;

/// Printable text stays text, binary answers are hex encoded.
pub fn excerpt(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(EXCERPT_LIMIT)];
    let printable = head
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();
    if !head.is_empty() && printable * 10 >= head.len() * 9 {
        String::from_utf8_lossy(head).into_owned()
    } else {
        hex::encode(&head[..head.len().min(EXCERPT_LIMIT / 2)])
    }
}
