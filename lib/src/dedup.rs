//! Crash deduplication. A crash is identified by its fingerprint, a digest of the crash class,
//! the normalized signal/location and the target. Two results with the same fingerprint are
//! the same bug: the first one is recorded, later ones only bump the counter.
use crate::execution::{CrashKind, CrashSignal, ExecutionResult};
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Mutex;
use tracing::{debug, info};

/// Frames of a stack trace that take part in the fingerprint
const MAX_FRAMES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    NewFingerprint(Fingerprint),
    Duplicate(Fingerprint),
}

impl DedupOutcome {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            DedupOutcome::NewFingerprint(fp) | DedupOutcome::Duplicate(fp) => fp,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, DedupOutcome::NewFingerprint(_))
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub fingerprint: Fingerprint,
    pub target: String,
    pub first_seen_request_id: u64,
    pub occurrence_count: u64,
    pub representative_request_id: u64,
    #[serde_as(as = "Hex")]
    pub representative_payload: Vec<u8>,
    pub signal: CrashSignal,
}

/// Replaces addresses and numbers so reruns of the same fault produce the same text.
fn mask_volatile(text: &str) -> String {
    text.split_whitespace()
        .map(|token| {
            if token.starts_with("0x") {
                "0x?"
            } else if token.chars().all(|c| c.is_ascii_digit()) {
                "N"
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pulls a stable crash location out of sanitizer reports, panics and stack traces.
fn normalize_location(kind: &CrashKind, diagnostic: &str) -> String {
    let mut parts = Vec::new();
    for line in diagnostic.lines().map(str::trim) {
        if let Some(idx) = line.find("Sanitizer:") {
            if let Some(error) = line[idx + "Sanitizer:".len()..].split_whitespace().next() {
                parts.push(error.to_string());
            }
        } else if let Some(idx) = line.find("panicked at ") {
            let location = line[idx + "panicked at ".len()..]
                .trim_end_matches(':')
                .split_whitespace()
                .next()
                .unwrap_or_default();
            parts.push(location.to_string());
        } else if line.starts_with('#') {
            // "#0 0x4f5e2a in parse_packet /src/parser.c:123:5"
            if let Some(function) = line.split(" in ").nth(1).and_then(|r| r.split_whitespace().next()) {
                if parts.iter().filter(|p| p.starts_with("fn:")).count() < MAX_FRAMES {
                    parts.push(format!("fn:{function}"));
                }
            }
        }
    }
    if !parts.is_empty() {
        return parts.join("|");
    }
    match kind {
        // The fatal answer itself identifies the fault, the raw bytes carry per-request ids
        CrashKind::ProtocolFatal(_) => String::new(),
        _ => diagnostic
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(mask_volatile)
            .unwrap_or_default(),
    }
}

fn normalize_signal(kind: &CrashKind) -> String {
    match kind {
        CrashKind::Signal(signal) => format!("sig{signal}"),
        CrashKind::ExitCode(code) => format!("exit{code}"),
        CrashKind::ProtocolFatal(detail) => detail.to_ascii_lowercase(),
        CrashKind::ConnectionReset => "reset".to_string(),
    }
}

pub fn fingerprint(target: &str, signal: &CrashSignal) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(signal.kind.class().as_bytes());
    hasher.update([0]);
    hasher.update(normalize_signal(&signal.kind).as_bytes());
    hasher.update([0]);
    hasher.update(normalize_location(&signal.kind, &signal.diagnostic).as_bytes());
    hasher.update([0]);
    hasher.update(target.as_bytes());
    let digest = hasher.finalize();
    Fingerprint(hex::encode(&digest[..16]))
}

/// Campaign scoped fingerprint map. All access goes through one lock, the critical
/// sections only touch the map.
#[derive(Debug, Default)]
pub struct CrashDeduplicator {
    records: Mutex<HashMap<Fingerprint, CrashRecord>>,
}

impl CrashDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a crash result. Returns `None` for results that are not crashes.
    pub fn record(&self, result: &ExecutionResult, payload: &[u8]) -> Option<DedupOutcome> {
        if !result.is_crash() {
            return None;
        }
        let signal = result.signal.clone().unwrap_or_else(|| CrashSignal {
            kind: CrashKind::ProtocolFatal("unspecified".to_string()),
            diagnostic: result.excerpt.clone(),
        });
        let fp = fingerprint(&result.target, &signal);

        let mut records = self.records.lock().unwrap();
        match records.entry(fp.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.occurrence_count += 1;
                // Smallest payload is the best reproducer, request id keeps it deterministic
                if (payload.len(), result.request_id)
                    < (
                        record.representative_payload.len(),
                        record.representative_request_id,
                    )
                {
                    record.representative_payload = payload.to_vec();
                    record.representative_request_id = result.request_id;
                }
                debug!(
                    "Known crash {fp} on {} seen {} times",
                    result.target, record.occurrence_count
                );
                Some(DedupOutcome::Duplicate(fp))
            }
            Entry::Vacant(entry) => {
                info!(
                    "New crash {fp} on {} ({}) from request {}",
                    result.target,
                    signal.kind.class(),
                    result.request_id
                );
                entry.insert(CrashRecord {
                    fingerprint: fp.clone(),
                    target: result.target.clone(),
                    first_seen_request_id: result.request_id,
                    occurrence_count: 1,
                    representative_request_id: result.request_id,
                    representative_payload: payload.to_vec(),
                    signal,
                });
                Some(DedupOutcome::NewFingerprint(fp))
            }
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CrashRecord> {
        self.records.lock().unwrap().get(fingerprint).cloned()
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<CrashRecord> {
        let mut records: Vec<CrashRecord> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.first_seen_request_id);
        records
    }

    pub fn fingerprint_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn total_crashes(&self) -> u64 {
        self.records
            .lock()
            .unwrap()
            .values()
            .map(|r| r.occurrence_count)
            .sum()
    }
}
