//! Sessions for stateful protocols. One session per (target, protocol), owned by the
//! campaign that opened it. Idle sessions expire lazily: the next access notices the
//! timeout, drops the session and reports [`SessionError::Expired`] so the caller can
//! open a fresh one.
use crate::protocol::{Params, ProtocolSpec, OPERATION_PARAM};
use crate::target::CampaignTarget;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} expired")]
    Expired(SessionId),
    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// Identifies the session a request runs in and its position inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: SessionId,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHandle {
    /// Returned for stateless protocols, every request stands alone.
    Stateless,
    Stateful {
        id: SessionId,
        target: String,
        protocol: String,
    },
}

impl SessionHandle {
    pub fn id(&self) -> Option<SessionId> {
        match self {
            SessionHandle::Stateless => None,
            SessionHandle::Stateful { id, .. } => Some(*id),
        }
    }

    pub fn is_stateless(&self) -> bool {
        matches!(self, SessionHandle::Stateless)
    }
}

/// Protocol state variables carried along a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub next_sequence: u32,
    /// Block-wise transfers (CoAP Block1/Block2) that have not been finished yet
    pub open_block_transfers: BTreeSet<u32>,
    pub variables: BTreeMap<String, String>,
    /// Stateful operations of an otherwise stateless protocol active on this session
    pub sub_capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct ProtocolSession {
    pub id: SessionId,
    pub target: String,
    pub protocol: String,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl ProtocolSession {
    fn new(target: &str, protocol: &str, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            protocol: protocol.to_string(),
            state: SessionState {
                next_sequence: 1,
                ..Default::default()
            },
            created_at: now,
            last_activity: now,
        }
    }

    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.duration_since(self.last_activity) >= idle_timeout
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    by_key: HashMap<(String, String), SessionId>,
    sessions: HashMap<SessionId, ProtocolSession>,
    opened_per_target: HashMap<String, u64>,
    expired: u64,
}

impl SessionTable {
    fn remove(&mut self, id: SessionId) -> Option<ProtocolSession> {
        let session = self.sessions.remove(&id)?;
        self.by_key
            .remove(&(session.target.clone(), session.protocol.clone()));
        Some(session)
    }
}

#[derive(Debug)]
pub struct SessionManager {
    idle_timeout: Duration,
    table: Mutex<SessionTable>,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            table: Mutex::new(SessionTable::default()),
        }
    }

    /// Creates or reuses the session for `target`. Stateless protocols get
    /// [`SessionHandle::Stateless`] unless `params` ask for a stateful operation.
    pub fn open_session(
        &self,
        target: &CampaignTarget,
        spec: &ProtocolSpec,
        params: &Params,
    ) -> Result<SessionHandle, SessionError> {
        if !spec.requires_session(params) {
            return Ok(SessionHandle::Stateless);
        }
        let now = Instant::now();
        let key = (target.name.clone(), spec.name.clone());
        let mut table = self.table.lock().unwrap();

        let id = match table.by_key.get(&key).copied() {
            Some(id) => {
                let expired = table
                    .sessions
                    .get(&id)
                    .map_or(true, |s| s.is_expired(now, self.idle_timeout));
                if expired {
                    table.remove(id);
                    table.expired += 1;
                    debug!("Session {id} for {} expired", target.name);
                    return Err(SessionError::Expired(id));
                }
                id
            }
            None => {
                let session = ProtocolSession::new(&target.name, &spec.name, now);
                let id = session.id;
                debug!("Opened session {id} for {} ({})", target.name, spec.name);
                table.sessions.insert(id, session);
                table.by_key.insert(key, id);
                *table
                    .opened_per_target
                    .entry(target.name.clone())
                    .or_default() += 1;
                id
            }
        };

        if let Some(session) = table.sessions.get_mut(&id) {
            session.last_activity = now;
            if let Some(op) = params
                .get(OPERATION_PARAM)
                .filter(|op| spec.stateful_operations.contains(*op))
            {
                session.state.sub_capabilities.insert(op.clone());
            }
        }
        Ok(SessionHandle::Stateful {
            id,
            target: target.name.clone(),
            protocol: spec.name.clone(),
        })
    }

    /// Hands out the next sequence number of the session and refreshes its activity.
    pub fn advance(&self, handle: &SessionHandle) -> Result<Option<SessionRef>, SessionError> {
        let Some(id) = handle.id() else {
            return Ok(None);
        };
        self.with_state(handle, |state| {
            let sequence = state.next_sequence;
            state.next_sequence = state.next_sequence.wrapping_add(1);
            Some(SessionRef { id, sequence })
        })
    }

    /// Runs `f` on the protocol state of a live session.
    pub fn with_state<R>(
        &self,
        handle: &SessionHandle,
        f: impl FnOnce(&mut SessionState) -> R,
    ) -> Result<R, SessionError> {
        let Some(id) = handle.id() else {
            return Ok(f(&mut SessionState::default()));
        };
        let now = Instant::now();
        let mut table = self.table.lock().unwrap();
        let expired = match table.sessions.get(&id) {
            None => return Err(SessionError::Closed(id)),
            Some(session) => session.is_expired(now, self.idle_timeout),
        };
        if expired {
            table.remove(id);
            table.expired += 1;
            return Err(SessionError::Expired(id));
        }
        let session = table
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::Closed(id))?;
        session.last_activity = now;
        Ok(f(&mut session.state))
    }

    /// Closing twice, or closing a stateless handle, is a no-op.
    pub fn close_session(&self, handle: &SessionHandle) -> bool {
        match handle.id() {
            Some(id) => self.table.lock().unwrap().remove(id).is_some(),
            None => false,
        }
    }

    pub fn close_all(&self) -> Vec<SessionId> {
        let mut table = self.table.lock().unwrap();
        table.by_key.clear();
        table.sessions.drain().map(|(id, _)| id).collect()
    }

    pub fn get(&self, id: SessionId) -> Option<ProtocolSession> {
        self.table.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.table.lock().unwrap().sessions.len()
    }

    pub fn sessions_opened(&self) -> u64 {
        self.table.lock().unwrap().opened_per_target.values().sum()
    }

    pub fn sessions_opened_for(&self, target: &str) -> u64 {
        self.table
            .lock()
            .unwrap()
            .opened_per_target
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    pub fn expired_count(&self) -> u64 {
        self.table.lock().unwrap().expired
    }
}
